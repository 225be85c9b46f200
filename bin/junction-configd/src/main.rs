use anyhow::{anyhow, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use junction_config::{ConfigError, ConfigSource, FileSource};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen: SocketAddr = match std::env::var("JUNCTION_CONFIG_LISTEN") {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid JUNCTION_CONFIG_LISTEN={}: {}", raw, e))?,
        Err(_) => SocketAddr::from(([0, 0, 0, 0], 8888)),
    };
    let root = PathBuf::from(
        std::env::var("JUNCTION_CONFIG_ROOT").unwrap_or_else(|_| "config-repo".to_string()),
    );
    if !root.is_dir() {
        // Refusing to serve beats serving an empty tree that resolves nothing.
        return Err(anyhow!("config root {} is not a directory", root.display()));
    }

    let source = Arc::new(FileSource::new(root));
    info!("Starting junction-configd serving {}", source.describe());

    let listener = TcpListener::bind(&listen).await?;
    info!("Config listener on {}", listen);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let source = source.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let source = source.clone();
                async move { handle_request(req, source).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving connection from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    source: Arc<FileSource>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let response = match (req.method().as_str(), segments.as_slice()) {
        ("GET", ["health"]) => json_response(
            StatusCode::OK,
            &serde_json::json!({"status": "UP", "source": source.describe()}),
        ),
        ("GET", ["config", service, profile]) => {
            match source.fetch(service, profile).await {
                Ok(document) => {
                    debug!(service, profile, version = %document.version, "resolved configuration");
                    match serde_json::to_vec(&document) {
                        Ok(body) => Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", "application/json")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                        Err(e) => json_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            &serde_json::json!({"error": e.to_string()}),
                        ),
                    }
                }
                // Hard failure by contract: the caller must abort startup,
                // never proceed with defaults.
                Err(ConfigError::Unavailable { detail }) => {
                    warn!(service, profile, detail, "config resolution failed");
                    json_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        &serde_json::json!({"error": detail}),
                    )
                }
            }
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({"error": "unknown route"}),
        ),
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
