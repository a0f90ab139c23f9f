//! Node Agent HTTP API
//!
//! JSON surface used by the scheduler side and by debugging tools:
//!
//! ```text
//! POST   /v1/workloads              BindingRequest → 202 WorkloadStatus
//! GET    /v1/workloads/{id}         → WorkloadStatus
//! POST   /v1/workloads/{id}/verify  → 202
//! DELETE /v1/workloads/{id}         → 202 (teardown or cancellation)
//! GET    /v1/status                 → NodeStatus
//! ```
//!
//! The router is generic over the request body so tests can drive it with
//! in-memory bodies.

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::controller::{BindingRequest, ReconcileLoop, VolumeRequest};
use crate::error::Error;
use crate::plugin::PluginRegistrar;
use crate::status::NodeStatus;
use crate::volume::{NodeName, WorkloadId};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state behind the API.
#[derive(Debug, Clone)]
pub struct ApiState {
    pub node: NodeName,
    pub reconcile: Arc<ReconcileLoop>,
    pub registrar: Option<Arc<PluginRegistrar>>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    reason: &'a str,
    message: String,
}

/// Route one request.
pub async fn handle<B>(
    state: Arc<ApiState>,
    req: Request<B>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "API request");

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["v1", "status"]) => {
            let status = NodeStatus::collect(
                &state.node,
                &state.reconcile,
                state.registrar.as_deref(),
            );
            json(StatusCode::OK, &status)
        }
        (&Method::POST, ["v1", "workloads"]) => create(&state, req).await,
        (&Method::GET, ["v1", "workloads", id]) => {
            match state.reconcile.status(&WorkloadId::new(*id)) {
                Some(status) => json(StatusCode::OK, &status),
                None => not_found(id),
            }
        }
        (&Method::POST, ["v1", "workloads", id, "verify"]) => {
            let workload_id = WorkloadId::new(*id);
            if state.reconcile.status(&workload_id).is_none() {
                not_found(id)
            } else {
                enqueue(&state, VolumeRequest::Verify(workload_id)).await
            }
        }
        (&Method::DELETE, ["v1", "workloads", id]) => {
            enqueue(&state, VolumeRequest::Teardown(WorkloadId::new(*id))).await
        }
        (_, ["v1", "status"]) | (_, ["v1", "workloads", ..]) => error(
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            format!("{} not allowed on {}", method, path),
        ),
        _ => error(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("no route for {}", path),
        ),
    };
    Ok(response)
}

async fn create<B>(state: &ApiState, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error(
                StatusCode::BAD_REQUEST,
                "BadRequest",
                format!("failed to read body: {}", e),
            )
        }
    };
    let binding: BindingRequest = match serde_json::from_slice(&body) {
        Ok(binding) => binding,
        Err(e) => {
            return error(
                StatusCode::BAD_REQUEST,
                "BadRequest",
                format!("invalid binding request: {}", e),
            )
        }
    };

    let workload_id = binding.workload_id.clone();
    match state.reconcile.submit(VolumeRequest::Create(binding)).await {
        Ok(()) => match state.reconcile.status(&workload_id) {
            Some(status) => json(StatusCode::ACCEPTED, &status),
            None => accepted(),
        },
        Err(e) => from_error(&e),
    }
}

async fn enqueue(state: &ApiState, request: VolumeRequest) -> Response<Full<Bytes>> {
    match state.reconcile.submit(request).await {
        Ok(()) => accepted(),
        Err(e) => from_error(&e),
    }
}

fn from_error(e: &Error) -> Response<Full<Bytes>> {
    let status = match e {
        Error::InvalidPath { .. } | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::WorkloadNotFound(_) => StatusCode::NOT_FOUND,
        Error::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, e.reason(), e.to_string())
}

fn not_found(id: &str) -> Response<Full<Bytes>> {
    from_error(&Error::WorkloadNotFound(id.to_string()))
}

fn accepted() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::ACCEPTED;
    response
}

fn error(status: StatusCode, reason: &str, message: String) -> Response<Full<Bytes>> {
    json(status, &ErrorBody { reason, message })
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to encode response: {}", e);
            let mut response = Response::new(Full::new(Bytes::from("internal error")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}
