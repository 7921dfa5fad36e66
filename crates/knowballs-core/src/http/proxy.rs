use anyhow::Context;
use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;

use crate::{error::ApiError, proxy::UpstreamEnv, types::QueryMode};

use super::AppState;

const PROXY_FAILURE: &str = "An error occurred while processing your request";

#[derive(Debug, Deserialize)]
pub struct ProxyParams {
    mode: Option<String>,
    env: Option<String>,
}

pub async fn describe(State(state): State<AppState>) -> Json<Value> {
    let endpoints = state.proxy.endpoints();
    Json(json!({
        "message": "This endpoint accepts POST requests for both dev and prod environments",
        "status": "ok",
        "environments": {
            "dev": endpoints.dev,
            "prod": endpoints.prod,
        },
        "usage": "Send POST requests with a JSON body and optional query parameters: ?env=dev|prod&mode=answer",
    }))
}

pub async fn forward(
    State(state): State<AppState>,
    Query(params): Query<ProxyParams>,
    body: Bytes,
) -> Response {
    match relay(&state, params, &body).await {
        Ok(data) => Json(data).into_response(),
        Err(ApiError::Unexpected(source)) => {
            error!(error = ?source, "proxy request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": PROXY_FAILURE })),
            )
                .into_response()
        }
        Err(error) => error.into_response(),
    }
}

async fn relay(state: &AppState, params: ProxyParams, body: &[u8]) -> Result<Value, ApiError> {
    let body = serde_json::from_slice::<Value>(body).context("proxy request body is not JSON")?;
    let mode = params
        .mode
        .filter(|mode| !mode.is_empty())
        .unwrap_or_else(|| QueryMode::default().as_str().to_owned());
    let env = UpstreamEnv::select(params.env.as_deref());
    state.proxy.forward(env, &mode, body).await
}
