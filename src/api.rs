use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::model::ModelArtifact;
use crate::storage::ArtifactStore;

/// Shared by every handler. The model is loaded once and never replaced.
#[derive(Clone)]
pub struct AppState {
    model: Arc<ModelArtifact>,
}

pub fn load_model(store: &dyn ArtifactStore, key: &str) -> anyhow::Result<ModelArtifact> {
    let bytes = store.get(key)?;
    let model = ModelArtifact::from_bytes(&bytes)
        .with_context(|| format!("could not load the model at {key}"))?;

    tracing::info!(
        "Loaded model with {} features: {}",
        model.features.len(),
        model.features.join(", ")
    );
    Ok(model)
}

pub fn router(model: ModelArtifact) -> Router {
    let state = AppState {
        model: Arc::new(model),
    };

    Router::new()
        .route("/get_house_prices", post(get_house_prices))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, model: ModelArtifact) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("  POST /get_house_prices");
    tracing::info!("  GET  /health");

    axum::serve(listener, router(model))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("could not listen for Ctrl+C, running until killed: {err}");
        std::future::pending::<()>().await;
    }
}

async fn get_house_prices(
    State(state): State<AppState>,
    Json(record): Json<HashMap<String, f64>>,
) -> Result<String, ApiError> {
    let price = state.model.predict_record(&record)?;
    Ok(format_price(price))
}

async fn health() -> &'static str {
    "OK"
}

/// Any failure past the extractors is a plain 500.
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("prediction failed: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    }
}

pub fn format_price(price: f64) -> String {
    format!(
        "{{'predicted_price': £{}}}",
        group_thousands(price.round() as i64)
    )
}

fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);

    if value < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
