//! Transfer-record handlers.

use crate::api::AppState;
use crate::api::auth::check_token_hash;
use crate::api::error_response::err_response;
use crate::topic::PAN_JSON;
use crate::types::PanOp;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

/// Body of a manual transfer operation
#[derive(Debug, Deserialize)]
pub struct OperateRequest {
    /// `save`, `delete`, or `retry` (retry is save with failure state cleared)
    pub opt: String,
    /// The record's share URL
    pub url: String,
}

/// GET /pan/:hash/:id - List a topic's transfer records
pub async fn list_transfers(
    State(state): State<AppState>,
    Path((hash, id)): Path<(String, String)>,
) -> Response {
    if !check_token_hash(state.mirror.token_hash(), &hash) {
        return err_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let Ok(id) = id.parse::<i64>() else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    let Some(pans) = state.mirror.pans() else {
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, "Pan is not configured");
    };
    let Some(topic) = state.mirror.topic(id) else {
        return err_response(StatusCode::NOT_FOUND, "Topic not found");
    };
    if !topic.root().is_exist(PAN_JSON) {
        return err_response(StatusCode::NOT_FOUND, "No transfer records");
    }
    match pans.records(&topic).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /pan/:hash/:id - Operate on one record (`save` | `delete` | `retry`)
pub async fn operate_transfer(
    State(state): State<AppState>,
    Path((hash, id)): Path<(String, String)>,
    body: Option<Json<OperateRequest>>,
) -> Response {
    if !check_token_hash(state.mirror.token_hash(), &hash) {
        return err_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let Ok(id) = id.parse::<i64>() else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    let Some(Json(request)) = body else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid request body");
    };
    let op = match request.opt.as_str() {
        "delete" => PanOp::Delete,
        // retry is save: it also clears the prior failure state
        "save" | "retry" => PanOp::Save,
        other => {
            return err_response(StatusCode::BAD_REQUEST, format!("Unknown operation {other}"));
        }
    };
    let Some(pans) = state.mirror.pans() else {
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, "Pan is not configured");
    };
    let Some(topic) = state.mirror.topic(id) else {
        return err_response(StatusCode::NOT_FOUND, "Topic not found");
    };
    match pans.operate(&topic, &request.url, op).await {
        Ok(()) => (StatusCode::OK, Json(id)).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
