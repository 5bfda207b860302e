//! Static pages and embedded assets.

use crate::api::AppState;
use crate::api::error_response::err_response;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};

const HOME_TEMPLATE: &str = include_str!("../../../assets/home.html");
const STYLE_CSS: &str = include_str!("../../../assets/style.css");
const FAVICON: &[u8] = include_bytes!("../../../assets/favicon.ico");

/// GET / - Landing page
pub async fn home_page(State(state): State<AppState>) -> Response {
    let page = HOME_TEMPLATE.replace("{{base_url}}", &state.mirror.net().base_url);
    Html(page).into_response()
}

/// GET /favicon.ico
pub async fn favicon() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/x-icon")],
        FAVICON,
    )
        .into_response()
}

/// GET /asset/:name - Embedded static assets
pub async fn static_asset(Path(name): Path<String>) -> Response {
    match name.as_str() {
        "style.css" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
            STYLE_CSS,
        )
            .into_response(),
        _ => err_response(StatusCode::NOT_FOUND, "No such asset"),
    }
}
