//! Downstream request forwarding with connection pooling and timeouts

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout as tokio_timeout;
use tracing::debug;

/// Why a downstream call failed. `Connect` and `Timeout` are eligible for
/// the gateway's single failover retry; everything else surfaces as-is.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to upstream {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("upstream {authority} did not respond within {timeout:?}")]
    Timeout { authority: String, timeout: Duration },

    #[error("upstream {authority} request failed: {source}")]
    Request {
        authority: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("failed to read upstream response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("invalid upstream uri: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),

    #[error("invalid forwarded request: {0}")]
    Http(#[from] hyper::http::Error),
}

impl ForwardError {
    /// Connection-level failures where another instance may well succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForwardError::Connect { .. } | ForwardError::Timeout { .. }
        )
    }
}

/// HTTP request forwarder for proxying to backend instances, with
/// connection pooling and a bounded per-attempt timeout.
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward one attempt to `authority` (host:port), preserving method,
    /// headers and body. A call exceeding the timeout is cancelled by
    /// dropping the in-flight future and reported as `Timeout`.
    pub async fn forward(
        &self,
        authority: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>, ForwardError> {
        let uri: Uri = format!("http://{}{}", authority, path_and_query).parse()?;
        debug!(%uri, %method, "forwarding request");

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))?;
        // Skip hop-by-hop headers; the client sets Host from the target URI.
        for (name, value) in headers {
            if *name == HOST || is_hop_by_hop_header(name.as_str()) {
                continue;
            }
            request.headers_mut().insert(name.clone(), value.clone());
        }

        let response = match tokio_timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) if source.is_connect() => {
                return Err(ForwardError::Connect {
                    authority: authority.to_string(),
                    source,
                });
            }
            Ok(Err(source)) => {
                return Err(ForwardError::Request {
                    authority: authority.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ForwardError::Timeout {
                    authority: authority.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        debug!(status = %response.status(), "upstream responded");
        let (mut parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        let hop_by_hop: Vec<_> = parts
            .headers
            .keys()
            .filter(|name| is_hop_by_hop_header(name.as_str()))
            .cloned()
            .collect();
        for name in hop_by_hop {
            parts.headers.remove(name);
        }

        Ok(Response::from_parts(parts, body))
    }
}

/// Headers that describe the connection rather than the message and must
/// not be forwarded.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarder_creation() {
        let forwarder = Forwarder::new(Duration::from_secs(30));
        assert_eq!(forwarder.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("keep-alive"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("authorization"));
    }

    #[tokio::test]
    async fn test_connect_error_is_retryable() {
        // Nothing listens on this port; bind-then-drop guarantees it was free.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = Forwarder::new(Duration::from_secs(2));
        let err = forwarder
            .forward(
                &addr.to_string(),
                Method::GET,
                "/",
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
