//! Per-request gateway state machine
//!
//! Each inbound request moves through resolve -> select -> forward against
//! the current routing snapshot. Resolution and selection are in-memory;
//! the only suspension point is the downstream call itself.

use crate::balance::BalancePolicy;
use crate::forwarder::Forwarder;
use crate::metrics::MetricsCollector;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode, Uri};
use junction_core::{RegistryStore, RouteTarget, SharedRoutingTable};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("no upstream available for service {service}: {detail}")]
    UpstreamUnavailable { service: String, detail: String },
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            GatewayError::ServiceNotFound(_) => "service_not_found",
            GatewayError::UpstreamUnavailable { .. } => "upstream_unavailable",
        }
    }
}

/// The routing front door: resolves `/{service}/{path}` against the current
/// routing table snapshot, picks an instance, and forwards.
pub struct Gateway {
    registry: Arc<RegistryStore>,
    table: SharedRoutingTable,
    forwarder: Forwarder,
    policy: Arc<dyn BalancePolicy>,
    metrics: Arc<MetricsCollector>,
}

impl Gateway {
    pub fn new(
        registry: Arc<RegistryStore>,
        table: SharedRoutingTable,
        forwarder: Forwarder,
        policy: Arc<dyn BalancePolicy>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            table,
            forwarder,
            policy,
            metrics,
        }
    }

    /// Handle one inbound request end to end. Never fails the connection;
    /// every error becomes a response with a clear body.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let started = Instant::now();

        if req.uri().path() == "/health" {
            return Ok(self.health_response().await);
        }

        // RESOLVE_SERVICE: the leading path segment names the service.
        let Some((service, path_and_query)) = split_target(req.uri()) else {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                "no service name in request path",
            ));
        };

        // Always the latest already-built snapshot; never blocks.
        let table = self.table.load_full();
        let Some(targets) = table.lookup(&service) else {
            let err = GatewayError::ServiceNotFound(service.clone());
            self.record_access(&service, None, err.outcome(), None, started);
            return Ok(error_response(err.status(), &err.to_string()));
        };

        let (parts, body) = req.into_parts();
        // The body is buffered once so a failover retry can resend it.
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(service = %service, error = %e, "failed to read client request body");
                self.record_access(&service, None, "bad_request", None, started);
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "failed to read request body",
                ));
            }
        };

        // SELECT_INSTANCE: policy pick over the snapshot's ordered targets.
        let Some(index) = self.policy.select(&service, &targets) else {
            let err = GatewayError::ServiceNotFound(service.clone());
            self.record_access(&service, None, err.outcome(), None, started);
            return Ok(error_response(err.status(), &err.to_string()));
        };
        let target = &targets[index];

        // FORWARD, with one failover retry against the next instance in
        // rotation when the failure is connection-level and an alternative
        // exists.
        match self
            .attempt(&service, target, &parts, &path_and_query, body.clone())
            .await
        {
            Ok(response) => {
                let status = response.status().as_u16();
                self.record_access(
                    &service,
                    Some(&target.instance_id),
                    "forwarded",
                    Some(status),
                    started,
                );
                Ok(into_full(response))
            }
            Err(err) if err.is_retryable() && targets.len() > 1 => {
                let retry_target = &targets[(index + 1) % targets.len()];
                warn!(
                    service = %service,
                    instance_id = %target.instance_id,
                    retry_instance_id = %retry_target.instance_id,
                    error = %err,
                    "forward failed, retrying against next instance"
                );
                match self
                    .attempt(&service, retry_target, &parts, &path_and_query, body)
                    .await
                {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        self.record_access(
                            &service,
                            Some(&retry_target.instance_id),
                            "forwarded",
                            Some(status),
                            started,
                        );
                        Ok(into_full(response))
                    }
                    Err(retry_err) => {
                        let err = GatewayError::UpstreamUnavailable {
                            service: service.clone(),
                            detail: retry_err.to_string(),
                        };
                        self.record_access(
                            &service,
                            Some(&retry_target.instance_id),
                            err.outcome(),
                            None,
                            started,
                        );
                        Ok(error_response(err.status(), &err.to_string()))
                    }
                }
            }
            Err(forward_err) => {
                let err = GatewayError::UpstreamUnavailable {
                    service: service.clone(),
                    detail: forward_err.to_string(),
                };
                self.record_access(
                    &service,
                    Some(&target.instance_id),
                    err.outcome(),
                    None,
                    started,
                );
                Ok(error_response(err.status(), &err.to_string()))
            }
        }
    }

    async fn attempt(
        &self,
        service: &str,
        target: &RouteTarget,
        parts: &hyper::http::request::Parts,
        path_and_query: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, crate::forwarder::ForwardError> {
        self.policy.on_request_start(service, &target.instance_id);
        let result = self
            .forwarder
            .forward(
                &target.authority(),
                parts.method.clone(),
                path_and_query,
                &parts.headers,
                body,
            )
            .await;
        self.policy.on_request_end(service, &target.instance_id);
        result
    }

    /// Structured access record for every terminal state.
    fn record_access(
        &self,
        service: &str,
        instance_id: Option<&str>,
        outcome: &str,
        status: Option<u16>,
        started: Instant,
    ) {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            target: "access",
            service,
            instance_id = instance_id.unwrap_or("-"),
            outcome,
            status = status.unwrap_or(0),
            latency_ms,
            "request completed"
        );
        self.metrics
            .observe_request(service, outcome, started.elapsed().as_secs_f64());
    }

    /// Aggregate health of the router itself.
    async fn health_response(&self) -> Response<Full<Bytes>> {
        let table = self.table.load_full();
        let body = serde_json::json!({
            "status": "UP",
            "services": self.registry.service_count().await,
            "instances": self.registry.instance_count().await,
            "routing_table": {
                "version": table.version(),
                "age_ms": table.age().as_millis() as u64,
                "services": table.service_count(),
                "targets": table.target_count(),
            },
        });
        json_response(StatusCode::OK, &body)
    }
}

/// Split `/{service}/{rest}?{query}` into the service name and the rewritten
/// downstream path-and-query (service segment stripped).
fn split_target(uri: &Uri) -> Option<(String, String)> {
    let path = uri.path();
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let service = segments.next().filter(|s| !s.is_empty())?.to_string();
    let rest = segments.next().unwrap_or("");

    let mut path_and_query = format!("/{}", rest);
    if let Some(query) = uri.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }
    Some((service, path_and_query))
}

fn into_full(response: Response<Bytes>) -> Response<Full<Bytes>> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Full::new(body))
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(format!("{}\n", message))))
        .unwrap()
}

pub(crate) fn json_response(
    status: StatusCode,
    body: &serde_json::Value,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
