//! REST API server module
//!
//! The HTTP surface over the mirror core: topic lifecycle, subscriptions,
//! rendered views with sandboxed asset serving, and transfer-record
//! management. All JSON; errors use `{"error": "<message>"}`. Token-gated
//! routes require an exact `Authorization: <token>` match; the `/view` and
//! `/pan` trees embed a short token hash in the path instead, so links can
//! be shared without exposing the token itself.

use crate::error::Result;
use crate::mirror::Mirror;
use axum::{
    Router,
    middleware,
    routing::{delete, get, post, put},
};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod auth;
pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Grace period for in-flight requests during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## Topics (token header gated)
/// - `GET /topic` - List topics (honours `If-Modified-Since`)
/// - `GET /topic/:id` - Single topic record
/// - `PUT /topic/:id` - Add topic
/// - `POST /topic/:id` - Update metadata
/// - `DELETE /topic/:id` - Soft-delete into the recycle bin
/// - `POST /topic/fresh/:id` - Enqueue a refresh
///
/// ## Subscriptions (token header gated)
/// - `GET /subscribe/:uid` - Subscription status
/// - `POST /subscribe/:uid` - Subscribe with optional filter
/// - `DELETE /subscribe/:uid` - Unsubscribe
/// - `POST /subscribe/batch` - Batch user lookup
///
/// ## Views (token hash in path)
/// - `GET /view/:hash/:id` - Rendered HTML view
/// - `GET /view/:hash/:id/:name` - Serve an asset (sandboxed)
/// - `DELETE /view/:hash/:id` - Force reload
///
/// ## Transfers (token hash in path)
/// - `GET /pan/:hash/:id` - List transfer records
/// - `POST /pan/:hash/:id` - Operate (`save` | `delete` | `retry`)
///
/// ## Static
/// - `GET /`, `GET /favicon.ico`, `GET /asset/:name`
pub fn create_router(mirror: Mirror) -> Router {
    let state = AppState::new(mirror.clone());
    let token = mirror.config().server.token.clone().filter(|t| !t.is_empty());

    let gated = Router::new()
        .route("/topic", get(routes::list_topics))
        .route("/topic/", get(routes::list_topics))
        .route("/topic/:id", get(routes::get_topic))
        .route("/topic/:id", put(routes::add_topic))
        .route("/topic/:id", post(routes::update_topic))
        .route("/topic/:id", delete(routes::delete_topic))
        .route("/topic/fresh/:id", post(routes::fresh_topic))
        .route("/subscribe/batch", post(routes::batch_users))
        .route("/subscribe/:uid", get(routes::subscription_status))
        .route("/subscribe/:uid", post(routes::subscribe))
        .route("/subscribe/:uid", delete(routes::unsubscribe));
    let gated = if token.is_some() {
        gated.layer(middleware::from_fn_with_state(token, auth::require_token))
    } else {
        gated
    };

    // The view/pan trees carry the token hash as a path segment and are
    // checked in their handlers.
    let hashed = Router::new()
        .route("/view/:hash/:id", get(routes::view_topic))
        .route("/view/:hash/:id", delete(routes::force_reload))
        .route("/view/:hash/:id/:name", get(routes::view_asset))
        .route("/pan/:hash/:id", get(routes::list_transfers))
        .route("/pan/:hash/:id", post(routes::operate_transfer));

    let router = Router::new()
        .merge(gated)
        .merge(hashed)
        .route("/", get(routes::home_page))
        .route("/favicon.ico", get(routes::favicon))
        .route("/asset/:name", get(routes::static_asset));

    let router = if mirror.config().server.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    // Handler panics become 500s instead of dropped connections.
    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the API server and run it until the mirror shuts down.
///
/// On shutdown, in-flight requests get a five second grace period before the
/// server task is aborted.
pub async fn start_api_server(mirror: Mirror) -> Result<()> {
    let port = mirror.config().server.port;
    let addr = format!("0.0.0.0:{port}");
    let stop = mirror.stop_token();

    let app = create_router(mirror);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(crate::error::Error::Io)?;
    tracing::info!(addr = %addr, "API server listening");

    let graceful = stop.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
    });

    tokio::select! {
        // The server ending on its own is a bind/accept failure.
        res = &mut server => match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(crate::error::Error::ApiServerError(e.to_string())),
            Err(e) => return Err(crate::error::Error::ApiServerError(e.to_string())),
        },
        _ = stop.cancelled() => {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("graceful shutdown deadline exceeded, aborting server");
                    server.abort();
                }
            }
        }
    }
    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
