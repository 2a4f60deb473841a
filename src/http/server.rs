//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info, warn};

use super::middleware::RateLimitLayer;
use crate::config::AdmissionConfig;
use crate::error::{Result, WardenError};
use crate::ratelimit::AdmissionBackend;

/// HTTP server exposing the health check and one guarded limit route per
/// policy at `/limits/{policy}`.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission backend shared by every route
    backend: Arc<dyn AdmissionBackend>,
    admission: AdmissionConfig,
    /// Policies to expose limit routes for
    policies: Vec<String>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        addr: SocketAddr,
        backend: Arc<dyn AdmissionBackend>,
        admission: AdmissionConfig,
        policies: Vec<String>,
    ) -> Self {
        Self {
            addr,
            backend,
            admission,
            policies,
        }
    }

    /// Build the router. Fails if any policy is unknown to the backend.
    pub fn router(&self) -> Result<Router> {
        let mut router = Router::new()
            .route("/healthz", get(healthz))
            .with_state(self.backend.clone());

        for policy in &self.policies {
            let layer = RateLimitLayer::new(self.backend.clone(), policy, &self.admission)?;
            let name = policy.clone();
            let limits = Router::new()
                .route(
                    &format!("/limits/{}", policy),
                    get(move || async move { Json(json!({ "policy": name, "status": "ok" })) }),
                )
                .layer(layer);
            router = router.merge(limits);
        }

        Ok(router)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router()?;
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            policies = ?self.policies,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                WardenError::Io(e)
            })
    }
}

async fn healthz(State(backend): State<Arc<dyn AdmissionBackend>>) -> Response {
    match backend.health().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
