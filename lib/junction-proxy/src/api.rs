//! Registration protocol and control-plane HTTP surface
//!
//! JSON over HTTP, consumed by business services: register, renew,
//! deregister, status updates, plus listings, health and metrics for
//! operators. Lives on its own listener so control routes can never collide
//! with a routed service name.

use crate::gateway::{error_response, json_response};
use crate::metrics::MetricsCollector;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use junction_core::{Instance, InstanceStatus, LeaseHandle, RegistryError, RegistryStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Generated when omitted; services that care about stable rotation
    /// order supply their own.
    pub instance_id: Option<String>,
    pub address: String,
    pub port: u16,
    /// Defaults to `UP`. Services with a warmup phase register as
    /// `STARTING` and promote themselves via the status route.
    pub status: Option<InstanceStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub service: String,
    pub instance_id: String,
    /// Suggested renewal cadence: a third of the lease timeout, so the
    /// lease survives up to two missed heartbeats.
    pub renew_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRequest {
    pub status: InstanceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceView {
    pub service: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub registered_at: DateTime<Utc>,
}

impl From<&Instance> for InstanceView {
    fn from(instance: &Instance) -> Self {
        Self {
            service: instance.service_name.clone(),
            instance_id: instance.instance_id.clone(),
            address: instance.address.clone(),
            port: instance.port,
            status: instance.status,
            registered_at: instance.registered_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Control-plane handler bound to the control listener.
pub struct ControlApi {
    registry: Arc<RegistryStore>,
    metrics: Arc<MetricsCollector>,
    lease_timeout: Duration,
}

impl ControlApi {
    pub fn new(
        registry: Arc<RegistryStore>,
        metrics: Arc<MetricsCollector>,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            lease_timeout,
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read control request body");
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "failed to read request body",
                ));
            }
        };

        let path = parts.uri.path().to_string();
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let response = match (parts.method.as_str(), segments.as_slice()) {
            ("GET", ["health"]) => self.health().await,
            ("GET", ["metrics"]) => self.metrics().await,
            ("GET", ["registry", "services"]) => self.list_services().await,
            ("GET", ["registry", "services", service, "instances"]) => {
                self.list_instances(service).await
            }
            ("POST", ["registry", "services", service, "instances"]) => {
                self.register(service, &body).await
            }
            ("PUT", ["registry", "services", service, "instances", instance_id, "renew"]) => {
                self.renew(service, instance_id).await
            }
            ("PUT", ["registry", "services", service, "instances", instance_id, "status"]) => {
                self.set_status(service, instance_id, &body).await
            }
            ("DELETE", ["registry", "services", service, "instances", instance_id]) => {
                self.deregister(service, instance_id).await
            }
            _ => error_response(StatusCode::NOT_FOUND, "unknown control route"),
        };
        Ok(response)
    }

    async fn register(&self, service: &str, body: &Bytes) -> Response<Full<Bytes>> {
        let request: RegisterRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return bad_request(&format!("invalid registration body: {}", e)),
        };

        let instance_id = request
            .instance_id
            .unwrap_or_else(|| format!("{}-{}", service, Uuid::new_v4()));
        let status = request.status.unwrap_or(InstanceStatus::Up);

        match self
            .registry
            .register_with_status(service, &instance_id, &request.address, request.port, status)
            .await
        {
            Ok(lease) => {
                let lease_body = LeaseResponse {
                    service: lease.service_name,
                    instance_id: lease.instance_id,
                    renew_interval_secs: (self.lease_timeout.as_secs() / 3).max(1),
                };
                json_body(StatusCode::CREATED, &lease_body)
            }
            Err(err @ RegistryError::DuplicateInstance { .. }) => {
                json_body(
                    StatusCode::CONFLICT,
                    &ErrorBody {
                        error: err.to_string(),
                    },
                )
            }
            Err(err) => json_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorBody {
                    error: err.to_string(),
                },
            ),
        }
    }

    async fn renew(&self, service: &str, instance_id: &str) -> Response<Full<Bytes>> {
        let lease = LeaseHandle::new(service, instance_id);
        match self.registry.renew(&lease).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "service": service,
                    "instance_id": instance_id,
                    "renewed": true,
                }),
            ),
            Err(err) => json_body(
                StatusCode::NOT_FOUND,
                &ErrorBody {
                    error: format!("{}; re-register to obtain a new lease", err),
                },
            ),
        }
    }

    async fn set_status(
        &self,
        service: &str,
        instance_id: &str,
        body: &Bytes,
    ) -> Response<Full<Bytes>> {
        let request: StatusRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return bad_request(&format!("invalid status body: {}", e)),
        };

        let lease = LeaseHandle::new(service, instance_id);
        match self.registry.set_status(&lease, request.status).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "service": service,
                    "instance_id": instance_id,
                    "status": request.status,
                }),
            ),
            Err(err) => json_body(
                StatusCode::NOT_FOUND,
                &ErrorBody {
                    error: err.to_string(),
                },
            ),
        }
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> Response<Full<Bytes>> {
        let lease = LeaseHandle::new(service, instance_id);
        self.registry.deregister(&lease).await;
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn list_services(&self) -> Response<Full<Bytes>> {
        let entries = self.registry.all_entries().await;
        let view: BTreeMap<String, Vec<InstanceView>> = entries
            .iter()
            .map(|(service, instances)| {
                (
                    service.clone(),
                    instances.iter().map(InstanceView::from).collect(),
                )
            })
            .collect();
        json_response(StatusCode::OK, &serde_json::json!({ "services": view }))
    }

    async fn list_instances(&self, service: &str) -> Response<Full<Bytes>> {
        let instances = self.registry.list_instances(service).await;
        let view: Vec<InstanceView> = instances.iter().map(InstanceView::from).collect();
        json_response(StatusCode::OK, &serde_json::json!({ "instances": view }))
    }

    async fn health(&self) -> Response<Full<Bytes>> {
        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "UP",
                "services": self.registry.service_count().await,
                "instances": self.registry.instance_count().await,
            }),
        )
    }

    async fn metrics(&self) -> Response<Full<Bytes>> {
        self.metrics
            .set_instance_count(self.registry.instance_count().await as i64);
        let text = self
            .metrics
            .gather()
            .unwrap_or_else(|_| "failed to gather metrics\n".to_string());
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(text)))
            .unwrap()
    }
}

fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_body(
        StatusCode::BAD_REQUEST,
        &ErrorBody {
            error: message.to_string(),
        },
    )
}

fn json_body<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}
