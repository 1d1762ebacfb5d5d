pub mod ai;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod protocol;
pub mod rooms;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use ai::{Generator, Orchestrator};
use config::Config;
use db::Gateway;
use rooms::Registry;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub gateway: Arc<dyn Gateway>,
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, gateway: Arc<dyn Gateway>, generator: Arc<dyn Generator>) -> Self {
        let registry = Arc::new(Registry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            gateway.clone(),
            generator,
            config.generation_timeout,
            config.context_window,
        ));

        AppState {
            gateway,
            registry,
            orchestrator,
            config: Arc::new(config),
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(rooms::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %format!("{:#}", self.0), "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            self.0.to_string(),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
