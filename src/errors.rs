use std::io::{self, ErrorKind};

use http::StatusCode;
use thiserror::Error;

use crate::fs::FsError;

pub(crate) type DavResult<T> = Result<T, DavError>;

/// Errors produced while handling a request.
///
/// Every variant maps onto exactly one HTTP status code, see
/// [`DavError::statuscode`].
#[derive(Debug, Error)]
pub enum DavError {
    #[error("XML parse error")]
    XmlReadError,
    #[error("XML parse error")]
    XmlParseError,
    #[error("invalid path")]
    InvalidPath,
    #[error("forbidden path")]
    ForbiddenPath,
    #[error("unknown DAV method")]
    UnknownDavMethod,
    #[error("{0}")]
    Status(StatusCode),
    #[error("{0}")]
    StatusClose(StatusCode),
    #[error("filesystem error: {0}")]
    FsError(FsError),
    #[error("I/O error: {0}")]
    IoError(io::Error),
    #[error("XML write error: {0}")]
    XmlWriterError(#[from] xml::writer::Error),
}

impl From<FsError> for DavError {
    fn from(e: FsError) -> Self {
        DavError::FsError(e)
    }
}

impl From<DavError> for io::Error {
    fn from(e: DavError) -> Self {
        match e {
            DavError::IoError(e) => e,
            DavError::FsError(e) => e.into(),
            _ => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<StatusCode> for DavError {
    fn from(e: StatusCode) -> Self {
        DavError::Status(e)
    }
}

impl From<xml::reader::Error> for DavError {
    fn from(_e: xml::reader::Error) -> Self {
        DavError::XmlParseError
    }
}

fn fserror_to_status(e: &FsError) -> StatusCode {
    match e {
        FsError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        FsError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
        FsError::Exists => StatusCode::METHOD_NOT_ALLOWED,
        FsError::NotFound => StatusCode::NOT_FOUND,
        FsError::Forbidden => StatusCode::FORBIDDEN,
        FsError::Conflict => StatusCode::CONFLICT,
        FsError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
        FsError::LoopDetected => StatusCode::LOOP_DETECTED,
        FsError::PathTooLong => StatusCode::URI_TOO_LONG,
        FsError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        FsError::IsRemote => StatusCode::BAD_GATEWAY,
    }
}

fn ioerror_to_status(e: &io::Error) -> StatusCode {
    match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl DavError {
    /// The HTTP status this error is reported with.
    pub fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::ForbiddenPath => StatusCode::FORBIDDEN,
            DavError::UnknownDavMethod => StatusCode::METHOD_NOT_ALLOWED,
            DavError::IoError(e) => ioerror_to_status(e),
            DavError::FsError(e) => fserror_to_status(e),
            DavError::Status(e) => *e,
            DavError::StatusClose(e) => *e,
            DavError::XmlWriterError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the connection should be closed after the response.
    pub fn must_close(&self) -> bool {
        !matches!(
            self,
            DavError::Status(_)
                | DavError::FsError(FsError::NotFound)
                | DavError::FsError(FsError::Forbidden)
                | DavError::FsError(FsError::Exists)
                | DavError::FsError(FsError::Conflict)
        )
    }

    /// Is this an internal failure the client should not see details of.
    pub(crate) fn is_internal(&self) -> bool {
        self.statuscode().is_server_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert_eq!(DavError::FsError(FsError::NotFound).statuscode(), StatusCode::NOT_FOUND);
        assert_eq!(DavError::ForbiddenPath.statuscode(), StatusCode::FORBIDDEN);
        assert_eq!(DavError::FsError(FsError::Conflict).statuscode(), StatusCode::CONFLICT);
        assert_eq!(DavError::Status(StatusCode::LOCKED).statuscode(), StatusCode::LOCKED);
        assert_eq!(DavError::XmlParseError.statuscode(), StatusCode::BAD_REQUEST);
        assert_eq!(
            DavError::FsError(FsError::InsufficientStorage).statuscode(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        let e = io::Error::new(ErrorKind::Other, "disk on fire");
        let e = DavError::from(e);
        assert_eq!(e.statuscode(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(e.is_internal());
    }

    #[test]
    fn test_must_close() {
        assert!(!DavError::Status(StatusCode::NOT_FOUND).must_close());
        assert!(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED).must_close());
    }
}
