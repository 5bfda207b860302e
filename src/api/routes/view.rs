//! Rendered views and sandboxed asset serving.

use crate::api::AppState;
use crate::api::auth::check_token_hash;
use crate::api::error_response::{err_response, from_error};
use crate::config::SmileMode;
use crate::error::Error;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};

const VIEW_TEMPLATE: &str = include_str!("../../../assets/view.html");

fn unauthorized() -> Response {
    err_response(StatusCode::UNAUTHORIZED, "Unauthorized")
}

/// GET /view/:hash/:id - Rendered HTML view of a topic
pub async fn view_topic(
    State(state): State<AppState>,
    Path((hash, id)): Path<(String, String)>,
) -> Response {
    if !check_token_hash(state.mirror.token_hash(), &hash) {
        return unauthorized();
    }

    let (title, markdown) = match id.parse::<i64>() {
        Err(_) => ("Invalid topic ID".to_string(), String::new()),
        Ok(id) => match state.mirror.topic(id) {
            None => ("Topic not found".to_string(), String::new()),
            Some(topic) => match topic.content() {
                Ok(content) => (topic.state().title, format!("{content}----\n")),
                Err(_) => ("Failed to read topic".to_string(), String::new()),
            },
        },
    };

    let page = VIEW_TEMPLATE
        .replace("{{title}}", &title)
        .replace("{{id}}", &id)
        .replace("{{token}}", state.mirror.token_hash())
        .replace("{{base_url}}", &state.mirror.net().base_url)
        .replace("{{markdown}}", &markdown);
    Html(page).into_response()
}

/// GET /view/:hash/:id/:name - Serve a topic asset (or a smiley when the id
/// segment is `smile`), strictly inside the topic's sandboxed directory.
pub async fn view_asset(
    State(state): State<AppState>,
    Path((hash, id, name)): Path<(String, String, String)>,
) -> Response {
    if !check_token_hash(state.mirror.token_hash(), &hash) {
        return unauthorized();
    }
    if name.is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "Invalid file name");
    }

    if id == "smile" {
        return serve_smile(&state, &name).await;
    }

    let Ok(id) = id.parse::<i64>() else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    let Some(topic) = state.mirror.topic(id) else {
        return err_response(StatusCode::NOT_FOUND, "Topic not found");
    };

    // Attachment fallback: `at_<file>` maps into the attachments directory.
    let root = topic.root();
    let lookup = if !root.is_exist(&name)
        && let Some(rest) = name.strip_prefix("at_")
    {
        format!("attachments/{rest}")
    } else {
        name.clone()
    };

    match root.read_all(&lookup) {
        Ok(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Err(Error::PathEscape(_)) => err_response(StatusCode::BAD_REQUEST, "Invalid file name"),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            err_response(StatusCode::NOT_FOUND, "Asset not found")
        }
        Err(e) => {
            tracing::warn!(topic = id, name = %lookup, error = %e, "asset read failed");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read asset")
        }
    }
}

async fn serve_smile(state: &AppState, name: &str) -> Response {
    let smile = state.mirror.smile();
    match state.mirror.config().smile {
        SmileMode::Web => match smile.url(name) {
            Some(url) => Redirect::permanent(&url).into_response(),
            None => err_response(StatusCode::NOT_FOUND, format!("Smile {name} not found")),
        },
        SmileMode::Local => match smile.local(name, &state.mirror.net().ua).await {
            Ok(data) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                data,
            )
                .into_response(),
            Err(e) => {
                tracing::debug!(name, error = %e, "smiley unavailable");
                err_response(StatusCode::NOT_FOUND, format!("Smile {name} not found"))
            }
        },
    }
}

/// DELETE /view/:hash/:id - Force reload (delete then re-add)
pub async fn force_reload(
    State(state): State<AppState>,
    Path((hash, id)): Path<(String, String)>,
) -> Response {
    if !check_token_hash(state.mirror.token_hash(), &hash) {
        return unauthorized();
    }
    let Ok(id) = id.parse::<i64>() else {
        return err_response(StatusCode::BAD_REQUEST, "Invalid topic ID");
    };
    match state.mirror.force_reload(id).await {
        Ok(()) => (StatusCode::OK, Json(id)).into_response(),
        Err(e) => from_error(&e),
    }
}
