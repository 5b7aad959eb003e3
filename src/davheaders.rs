use std::fmt::Display;

use headers::Header;
use http::header::{HeaderName, HeaderValue};
use url::Url;

lazy_static! {
    static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    static ref TIMEOUT: HeaderName = HeaderName::from_static("timeout");
    static ref OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
    static ref DESTINATION: HeaderName = HeaderName::from_static("destination");
    static ref LOCK_TOKEN: HeaderName = HeaderName::from_static("lock-token");
    static ref IF: HeaderName = HeaderName::from_static("if");
    static ref CONTENT_LOCATION: HeaderName = HeaderName::from_static("content-location");
}

// helper: exactly one header value, as a str.
fn one<'i, I>(values: &mut I) -> Result<&'i str, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let v = values.next().ok_or_else(headers::Error::invalid)?;
    if values.next().is_some() {
        return Err(headers::Error::invalid());
    }
    v.to_str().map_err(|_| headers::Error::invalid())
}

fn encode_str<E: Extend<HeaderValue>>(values: &mut E, s: impl Display) {
    if let Ok(v) = HeaderValue::from_str(&s.to_string()) {
        values.extend(std::iter::once(v));
    }
}

// An absolute URL or an absolute path; returns the (still encoded) path.
fn url_path(s: &str) -> Option<String> {
    if s.starts_with('/') {
        return Some(s.to_string());
    }
    let url = Url::parse(s).ok()?;
    Some(url.path().to_string())
}

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        match one(values)?.trim().to_ascii_lowercase().as_str() {
            "0" => Ok(Depth::Zero),
            "1" => Ok(Depth::One),
            "infinity" => Ok(Depth::Infinity),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let v = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(v)));
    }
}

/// One of the values of a Timeout: header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DavTimeout {
    Seconds(u32),
    Infinite,
}

/// Timeout: header. Values in order of preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeout(pub Vec<DavTimeout>);

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut v = Vec::new();
        for word in one(values)?.split(',').map(|w| w.trim()) {
            let t = if word.eq_ignore_ascii_case("infinite") {
                DavTimeout::Infinite
            } else if word.get(..7).is_some_and(|w| w.eq_ignore_ascii_case("second-")) {
                // clients send silly large values; saturate.
                match word[7..].parse::<u64>() {
                    Ok(n) => DavTimeout::Seconds(n.min(u32::MAX as u64) as u32),
                    Err(_) => return Err(headers::Error::invalid()),
                }
            } else {
                return Err(headers::Error::invalid());
            };
            v.push(t);
        }
        Ok(Timeout(v))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = self
            .0
            .iter()
            .map(|t| match t {
                DavTimeout::Seconds(n) => format!("Second-{n}"),
                DavTimeout::Infinite => "Infinite".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        encode_str(values, s);
    }
}

/// Overwrite: header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        match one(values)?.trim() {
            "T" | "t" => Ok(Overwrite(true)),
            "F" | "f" => Ok(Overwrite(false)),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let v = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(v)));
    }
}

/// Destination: header. Holds the (encoded) path part of the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.trim();
        url_path(s).map(Destination).ok_or_else(headers::Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        encode_str(values, &self.0);
    }
}

/// Lock-Token: header. Holds the token without the angle brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl Header for LockToken {
    fn name() -> &'static HeaderName {
        &LOCK_TOKEN
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.trim();
        match s.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            Some(t) if !t.is_empty() => Ok(LockToken(t.to_string())),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        encode_str(values, format!("<{}>", self.0));
    }
}

/// Content-Location: header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentLocation(pub String);

impl Header for ContentLocation {
    fn name() -> &'static HeaderName {
        &CONTENT_LOCATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        Ok(ContentLocation(one(values)?.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        encode_str(values, &self.0);
    }
}

/// A condition in an If: header list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfItem {
    /// `<opaquelocktoken:...>`, or any other coded URL.
    StateToken(String),
    /// `["etag"]`. Stored as sent, quotes included.
    ETag(String),
}

/// `["Not"] condition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfCondition {
    pub not: bool,
    pub item: IfItem,
}

/// One parenthesized list, optionally tagged with the resource it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfList {
    pub resource_tag: Option<String>,
    pub conditions: Vec<IfCondition>,
}

/// If: header (RFC 4918 10.4).
///
/// The header as a whole matches if any of the lists matches; a list
/// matches if all of its conditions do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct If(pub Vec<IfList>);

impl If {
    /// All state tokens in the header that are not negated. These are
    /// "submitted", whether or not their list evaluates to true.
    pub fn tokens(&self) -> Vec<String> {
        let mut v: Vec<String> = Vec::new();
        for c in self.0.iter().flat_map(|l| l.conditions.iter()) {
            if let IfCondition {
                not: false,
                item: IfItem::StateToken(t),
            } = c
            {
                if !v.contains(t) {
                    v.push(t.clone());
                }
            }
        }
        v
    }
}

struct IfParser<'a> {
    s: &'a str,
}

impl<'a> IfParser<'a> {
    fn skip_ws(&mut self) {
        self.s = self.s.trim_start();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        match self.s.strip_prefix(c) {
            Some(rest) => {
                self.s = rest;
                true
            }
            None => false,
        }
    }

    // read up to (not including) `end`, which is consumed.
    fn until(&mut self, end: char) -> Option<&'a str> {
        let idx = self.s.find(end)?;
        let r = &self.s[..idx];
        self.s = &self.s[idx + end.len_utf8()..];
        Some(r)
    }

    fn condition(&mut self) -> Option<IfCondition> {
        self.skip_ws();
        let mut not = false;
        if self.s.get(..3).is_some_and(|w| w.eq_ignore_ascii_case("not")) {
            not = true;
            self.s = &self.s[3..];
            self.skip_ws();
        }
        let item = if self.eat('<') {
            IfItem::StateToken(self.until('>')?.trim().to_string())
        } else if self.eat('[') {
            IfItem::ETag(self.until(']')?.trim().to_string())
        } else {
            return None;
        };
        Some(IfCondition { not, item })
    }

    fn list(&mut self, tag: Option<&str>) -> Option<IfList> {
        if !self.eat('(') {
            return None;
        }
        let mut conditions = Vec::new();
        while !self.eat(')') {
            conditions.push(self.condition()?);
        }
        if conditions.is_empty() {
            return None;
        }
        Some(IfList {
            resource_tag: tag.map(|t| t.to_string()),
            conditions,
        })
    }

    fn parse(mut self) -> Option<If> {
        let mut lists = Vec::new();
        let mut tag: Option<String> = None;
        let mut tagged = None;
        loop {
            self.skip_ws();
            if self.s.is_empty() {
                break;
            }
            if self.eat('<') {
                // either all lists are tagged, or none are.
                if tagged == Some(false) {
                    return None;
                }
                tagged = Some(true);
                tag = Some(url_path(self.until('>')?.trim())?);
                // a tag must be followed by at least one list.
                lists.push(self.list(tag.as_deref())?);
                continue;
            }
            if tagged.is_none() {
                tagged = Some(false);
            }
            lists.push(self.list(tag.as_deref())?);
        }
        if lists.is_empty() {
            return None;
        }
        Some(If(lists))
    }
}

impl Header for If {
    fn name() -> &'static HeaderName {
        &IF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        // multiple If: headers are one list.
        let mut lists = Vec::new();
        for v in values {
            let s = v.to_str().map_err(|_| headers::Error::invalid())?;
            let h = IfParser { s }.parse().ok_or_else(headers::Error::invalid)?;
            lists.extend(h.0);
        }
        if lists.is_empty() {
            return Err(headers::Error::invalid());
        }
        Ok(If(lists))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let mut s = String::new();
        for l in &self.0 {
            if let Some(ref t) = l.resource_tag {
                s.push_str(&format!("<{t}> "));
            }
            s.push('(');
            let conds = l
                .conditions
                .iter()
                .map(|c| {
                    let not = if c.not { "Not " } else { "" };
                    match c.item {
                        IfItem::StateToken(ref t) => format!("{not}<{t}>"),
                        IfItem::ETag(ref e) => format!("{not}[{e}]"),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            s.push_str(&conds);
            s.push_str(") ");
        }
        encode_str(values, s.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headers::HeaderMapExt;
    use http::HeaderMap;

    fn parse_if(s: &str) -> Option<If> {
        let mut h = HeaderMap::new();
        h.insert("if", HeaderValue::from_str(s).unwrap());
        h.typed_get::<If>()
    }

    #[test]
    fn test_if_untagged() {
        let h = parse_if("(<opaquelocktoken:abc> [\"etag1\"]) (Not <DAV:no-lock>)").unwrap();
        assert_eq!(h.0.len(), 2);
        assert_eq!(h.0[0].resource_tag, None);
        assert_eq!(
            h.0[0].conditions,
            vec![
                IfCondition {
                    not: false,
                    item: IfItem::StateToken("opaquelocktoken:abc".to_string())
                },
                IfCondition {
                    not: false,
                    item: IfItem::ETag("\"etag1\"".to_string())
                },
            ]
        );
        assert!(h.0[1].conditions[0].not);
        assert_eq!(h.tokens(), vec!["opaquelocktoken:abc".to_string()]);
    }

    #[test]
    fn test_if_tagged() {
        let h = parse_if(
            "<http://www.example.com/dav/a%20b> (<opaquelocktoken:1>) \
             (<opaquelocktoken:2>) </dav/c> ([W/\"x\"])",
        )
        .unwrap();
        assert_eq!(h.0.len(), 3);
        assert_eq!(h.0[0].resource_tag.as_deref(), Some("/dav/a%20b"));
        assert_eq!(h.0[1].resource_tag.as_deref(), Some("/dav/a%20b"));
        assert_eq!(h.0[2].resource_tag.as_deref(), Some("/dav/c"));
        assert_eq!(h.tokens().len(), 2);
    }

    #[test]
    fn test_if_invalid() {
        assert!(parse_if("").is_none());
        assert!(parse_if("()").is_none());
        assert!(parse_if("(<opaquelocktoken:1>").is_none());
        assert!(parse_if("<http://x/> ").is_none());
        assert!(parse_if("(foo)").is_none());
        // mixing tagged and untagged lists.
        assert!(parse_if("(<a:b>) </x> (<c:d>)").is_none());
    }

    #[test]
    fn test_simple_headers() {
        let mut h = HeaderMap::new();
        h.insert("depth", HeaderValue::from_static("Infinity"));
        h.insert("overwrite", HeaderValue::from_static("F"));
        h.insert("timeout", HeaderValue::from_static("Infinite, Second-4100000000"));
        h.insert("lock-token", HeaderValue::from_static("<opaquelocktoken:xyz>"));
        h.insert("destination", HeaderValue::from_static("http://host:8080/dav/x%20y/"));
        assert_eq!(h.typed_get::<Depth>(), Some(Depth::Infinity));
        assert_eq!(h.typed_get::<Overwrite>(), Some(Overwrite(false)));
        assert_eq!(
            h.typed_get::<Timeout>(),
            Some(Timeout(vec![DavTimeout::Infinite, DavTimeout::Seconds(4100000000)]))
        );
        assert_eq!(
            h.typed_get::<LockToken>(),
            Some(LockToken("opaquelocktoken:xyz".to_string()))
        );
        assert_eq!(
            h.typed_get::<Destination>(),
            Some(Destination("/dav/x%20y/".to_string()))
        );

        h.insert("depth", HeaderValue::from_static("2"));
        assert!(h.typed_try_get::<Depth>().is_err());
    }
}
