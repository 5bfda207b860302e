//! Author subscription handlers.

use crate::api::AppState;
use crate::api::error_response::err_response;
use crate::types::UserRecord;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;

/// GET /subscribe/:uid - Subscription status
#[utoipa::path(
    get,
    path = "/subscribe/{uid}",
    tag = "subscriptions",
    params(("uid" = i64, Path, description = "Author uid")),
    responses((status = 200, description = "Whether the author is subscribed", body = bool))
)]
pub async fn subscription_status(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    let subscribed = uid
        .parse::<i64>()
        .map(|uid| state.mirror.is_subscribed(uid))
        .unwrap_or(false);
    Json(subscribed)
}

/// POST /subscribe/:uid - Subscribe, with an optional filter list body
#[utoipa::path(
    post,
    path = "/subscribe/{uid}",
    tag = "subscriptions",
    params(("uid" = i64, Path, description = "Author uid")),
    request_body = Vec<String>,
    responses(
        (status = 200, description = "Subscribed", body = UserRecord),
        (status = 400, description = "Invalid uid"),
        (status = 500, description = "User lookup failed")
    )
)]
pub async fn subscribe(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    body: Option<Json<Vec<String>>>,
) -> Response {
    let Ok(uid) = uid.parse::<i64>() else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid user ID");
    };
    let filter = body.map(|Json(f)| f).filter(|f| !f.is_empty());
    match state.mirror.subscribe(uid, filter).await {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// DELETE /subscribe/:uid - Unsubscribe
#[utoipa::path(
    delete,
    path = "/subscribe/{uid}",
    tag = "subscriptions",
    params(("uid" = i64, Path, description = "Author uid")),
    responses(
        (status = 200, description = "Unsubscribed"),
        (status = 400, description = "Invalid uid"),
        (status = 500, description = "Persisting the record failed")
    )
)]
pub async fn unsubscribe(State(state): State<AppState>, Path(uid): Path<String>) -> Response {
    let Ok(uid) = uid.parse::<i64>() else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid user ID");
    };
    match state.mirror.unsubscribe(uid).await {
        Ok(()) => (StatusCode::OK, Json(uid)).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /subscribe/batch - Batch user lookup by names (or numeric uids)
#[utoipa::path(
    post,
    path = "/subscribe/batch",
    tag = "subscriptions",
    request_body = Vec<String>,
    responses(
        (status = 200, description = "uid → user for every resolvable entry"),
        (status = 400, description = "Invalid request body")
    )
)]
pub async fn batch_users(
    State(state): State<AppState>,
    body: Option<Json<Vec<String>>>,
) -> Response {
    let Some(Json(keys)) = body else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid request body");
    };

    let mut found: HashMap<i64, UserRecord> = HashMap::new();
    for key in keys {
        let result = match key.parse::<i64>() {
            Ok(uid) => state.mirror.users().by_uid(uid).await,
            Err(_) => state.mirror.users().by_name(&key).await,
        };
        match result {
            Ok(user) => {
                found.insert(user.id, user);
            }
            Err(e) => tracing::debug!(key, error = %e, "batch lookup miss"),
        }
    }
    (StatusCode::OK, Json(found)).into_response()
}
