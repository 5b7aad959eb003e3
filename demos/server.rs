//
//  Sample server.
//
//  Listens on localhost:4918, plain http, no ssl.
//  Connect to http://localhost:4918/
//
//  With --dir (or --config) a local directory is served through the
//  `WebDav` adapter; without, an in-memory filesystem through the bare
//  engine.
//

use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;

use clap::Parser;
use futures_util::future::TryFutureExt;
use headers::{authorization::Basic, Authorization, HeaderMapExt};

use dav_engine::{body::Body, DavHandler, FileSystem, LockSystem, PropStore, WebDav, WebDavConfig};

#[derive(Clone)]
enum Backend {
    Engine(DavHandler),
    Adapter(WebDav),
}

#[derive(Clone)]
struct Server {
    backend: Backend,
    auth: bool,
}

impl Server {
    async fn handle(&self, req: hyper::Request<hyper::Body>) -> Result<hyper::Response<Body>, Infallible> {
        let user = if self.auth {
            // we want the client to authenticate.
            match req.headers().typed_get::<Authorization<Basic>>() {
                Some(Authorization(basic)) => Some(basic.username().to_string()),
                None => {
                    let response = hyper::Response::builder()
                        .status(401)
                        .header("WWW-Authenticate", "Basic realm=\"dav\"")
                        .body(Body::from("please auth"))
                        .unwrap();
                    return Ok(response);
                }
            }
        } else {
            None
        };

        let res = match &self.backend {
            Backend::Engine(dh) => match user {
                Some(user) => dh.handle_with(req, None, Some(user)).await,
                None => dh.handle(req).await,
            },
            Backend::Adapter(wd) => wd.serve(req, &()).await,
        };
        Ok(res)
    }
}

#[derive(Debug, clap::Parser)]
#[command(about, version)]
struct Cli {
    /// port to listen on
    #[arg(short, long, default_value = "4918")]
    port: u16,
    /// local directory to serve
    #[arg(short, long)]
    dir: Option<String>,
    /// URL prefix to strip
    #[arg(long, default_value = "")]
    prefix: String,
    /// adapter configuration as a JSON file ({"root", "prefix", "create_parents"})
    #[arg(short, long)]
    config: Option<String>,
    /// require basic authentication
    #[arg(short, long)]
    auth: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();

    let config = match (&cli.config, &cli.dir) {
        (Some(file), _) => Some(serde_json::from_str::<WebDavConfig>(&std::fs::read_to_string(file)?)?),
        (None, Some(dir)) => Some(WebDavConfig {
            root: dir.clone(),
            prefix: cli.prefix.clone(),
            ..WebDavConfig::default()
        }),
        (None, None) => None,
    };

    let (backend, name) = match config {
        Some(config) => {
            let name = config.root.clone();
            (Backend::Adapter(WebDav::provision(config)), name)
        }
        None => {
            let dh = DavHandler::builder(FileSystem::Mem)
                .strip_prefix(cli.prefix.clone())
                .locksystem(LockSystem::Mem)
                .propstore(PropStore::Mem)
                .build();
            (Backend::Engine(dh), "memory filesystem".to_string())
        }
    };

    let server = Server {
        backend,
        auth: cli.auth,
    };
    let make_service = hyper::service::make_service_fn(|_| {
        let server = server.clone();
        async move {
            let func = move |req| {
                let server = server.clone();
                async move { server.handle(req).await }
            };
            Ok::<_, hyper::Error>(hyper::service::service_fn(func))
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let server = hyper::Server::try_bind(&addr)?
        .serve(make_service)
        .map_err(|e| eprintln!("server error: {}", e));

    println!("Serving {} on {}", name, cli.port);
    let _ = server.await;
    Ok(())
}
