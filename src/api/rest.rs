use crate::config::ApiConfig;
use crate::error::Error;
use crate::sync::SyncEngine;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::info;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

pub mod events_controller;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::DeviceUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::TransferRead(_) => StatusCode::BAD_GATEWAY,
            Error::IntegrityMismatch(_) | Error::Cancelled(_) => StatusCode::CONFLICT,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(err) = err.downcast_ref::<Error>() {
            return (*err).clone().into();
        }

        ApiError {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    // Allow all origins and preflight requests
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health))
        .merge(events_controller::routes())
        .with_state(state)
        .layer(cors)
}

pub struct RestApi {
    config: ApiConfig,
    engine: Arc<SyncEngine>,
}

impl RestApi {
    pub fn new(config: &ApiConfig, engine: Arc<SyncEngine>) -> Self {
        Self {
            config: config.clone(),
            engine,
        }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let app = router(AppState {
            engine: Arc::clone(&self.engine),
        });

        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;

        info!("API server listening on {}", addr);

        axum::Server::try_bind(&addr)?
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
