// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP endpoint over a shared [`FeatureExtractor`].
//!
//! | Method | Path | Body |
//! |---|---|---|
//! | `POST` | `/activation/topk-by-token` | [`TopkByTokenRequest`] → [`TopkByTokenResponse`] |
//! | `GET` | `/health` | `{"status": "ok", "sources": [...]}` |
//!
//! Errors are `{"error": "<message>"}` (see [`ApiError`]).

pub mod error;
pub mod logging;

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::extract::FeatureExtractor;
use crate::request::{TopkByTokenRequest, TopkByTokenResponse};

pub use error::ApiError;

/// Build the router.
pub fn router(extractor: Arc<FeatureExtractor>) -> Router {
    Router::new()
        .route("/activation/topk-by-token", post(topk_by_token))
        .route("/health", get(health))
        .with_state(extractor)
}

async fn topk_by_token(
    State(extractor): State<Arc<FeatureExtractor>>,
    request: Result<Json<TopkByTokenRequest>, JsonRejection>,
) -> Result<Json<TopkByTokenResponse>, ApiError> {
    let Json(request) = request?;
    Ok(Json(extractor.topk_by_token(request).await?))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    sources: Vec<String>,
}

async fn health(State(extractor): State<Arc<FeatureExtractor>>) -> Json<Health> {
    let sources = extractor
        .dictionaries()
        .sources()
        .into_iter()
        .map(str::to_string)
        .collect();
    Json(Health {
        status: "ok",
        sources,
    })
}
