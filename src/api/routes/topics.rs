//! Topic lifecycle handlers.

use crate::api::AppState;
use crate::api::error_response::{err_response, from_error};
use crate::topic::TopicView;
use crate::types::Metadata;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().filter(|id| *id > 0)
}

/// GET /topic - List topics; honours `If-Modified-Since` (RFC1123)
#[utoipa::path(
    get,
    path = "/topic",
    tag = "topics",
    responses(
        (status = 200, description = "Topic records", body = Vec<TopicView>)
    )
)]
pub async fn list_topics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let since: Option<DateTime<Utc>> = headers
        .get("if-modified-since")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let mut topics = state.mirror.all_topics();
    topics.sort_by_key(|t| t.id.0);

    let mut views: Vec<TopicView> = Vec::with_capacity(topics.len());
    for topic in topics {
        if let Some(since) = since
            && topic.mod_at() <= since
        {
            continue;
        }
        views.push(topic.view().await);
    }
    Json(views)
}

/// GET /topic/:id - Single topic record
#[utoipa::path(
    get,
    path = "/topic/{id}",
    tag = "topics",
    params(("id" = i64, Path, description = "Topic id")),
    responses(
        (status = 200, description = "Topic record", body = TopicView),
        (status = 400, description = "Invalid topic id"),
        (status = 404, description = "Topic not found")
    )
)]
pub async fn get_topic(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    match state.mirror.topic(id) {
        Some(topic) => (StatusCode::OK, Json(topic.view().await)).into_response(),
        None => err_response(StatusCode::NOT_FOUND, "Topic not found"),
    }
}

/// PUT /topic/:id - Add a topic
#[utoipa::path(
    put,
    path = "/topic/{id}",
    tag = "topics",
    params(("id" = i64, Path, description = "Topic id")),
    responses(
        (status = 201, description = "Topic added", body = i64),
        (status = 400, description = "Invalid topic id"),
        (status = 409, description = "Topic already exists"),
        (status = 503, description = "Refresh queue is full")
    )
)]
pub async fn add_topic(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    match state.mirror.add_topic(id).await {
        Ok(()) => (StatusCode::CREATED, Json(id)).into_response(),
        Err(e) => from_error(&e),
    }
}

/// POST /topic/:id - Update topic metadata
#[utoipa::path(
    post,
    path = "/topic/{id}",
    tag = "topics",
    params(("id" = i64, Path, description = "Topic id")),
    request_body = Metadata,
    responses(
        (status = 200, description = "Metadata updated", body = i64),
        (status = 400, description = "Invalid id, body, or cron expression"),
        (status = 404, description = "Topic not found")
    )
)]
pub async fn update_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<Metadata>>,
) -> Response {
    let Some(id) = parse_id(&id) else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    let Some(Json(update)) = body else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid request body");
    };
    match state.mirror.update_topic(id, update).await {
        Ok(()) => (StatusCode::OK, Json(id)).into_response(),
        Err(e) => from_error(&e),
    }
}

/// DELETE /topic/:id - Soft-delete into the recycle bin
#[utoipa::path(
    delete,
    path = "/topic/{id}",
    tag = "topics",
    params(("id" = i64, Path, description = "Topic id")),
    responses(
        (status = 200, description = "Topic deleted", body = i64),
        (status = 400, description = "Invalid topic id"),
        (status = 404, description = "Topic not found")
    )
)]
pub async fn delete_topic(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    match state.mirror.delete_topic(id).await {
        Ok(()) => (StatusCode::OK, Json(id)).into_response(),
        Err(e) => from_error(&e),
    }
}

/// POST /topic/fresh/:id - Enqueue a one-off refresh
#[utoipa::path(
    post,
    path = "/topic/fresh/{id}",
    tag = "topics",
    params(("id" = i64, Path, description = "Topic id")),
    responses(
        (status = 200, description = "Refresh queued", body = i64),
        (status = 400, description = "Invalid topic id"),
        (status = 404, description = "Topic not found"),
        (status = 503, description = "Refresh queue is full")
    )
)]
pub async fn fresh_topic(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    match state.mirror.refresh(id) {
        Ok(()) => (StatusCode::OK, Json(id)).into_response(),
        Err(e) => from_error(&e),
    }
}
