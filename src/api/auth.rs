//! Authentication for the REST API
//!
//! Two schemes cover the surface: the JSON management routes require an
//! exact `Authorization: <token>` header match, and the `/view`//`/pan`
//! trees carry a short SHA-1 token hash as a path segment so rendered pages
//! can link assets without ever embedding the token. When no token is
//! configured, everything is public and the hash segment is `-`.

use super::error_response::err_response;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

/// Header middleware for the token-gated routes.
pub async fn require_token(
    State(expected): State<Option<String>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = expected else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            next.run(request).await
        }
        _ => err_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
    }
}

/// Path-segment check for the `/view` and `/pan` trees.
pub fn check_token_hash(expected: &str, provided: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request as HttpRequest, middleware, routing::get};
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn app(token: Option<String>) -> Router {
        Router::new()
            .route("/topic", get(ok_handler))
            .layer(middleware::from_fn_with_state(token, require_token))
    }

    #[tokio::test]
    async fn test_no_token_configured_is_public() {
        let resp = app(None)
            .oneshot(HttpRequest::builder().uri("/topic").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exact_token_passes() {
        let resp = app(Some("secret".into()))
            .oneshot(
                HttpRequest::builder()
                    .uri("/topic")
                    .header("Authorization", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_or_missing_token_is_unauthorized() {
        for request in [
            HttpRequest::builder()
                .uri("/topic")
                .header("Authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
            HttpRequest::builder().uri("/topic").body(Body::empty()).unwrap(),
        ] {
            let resp = app(Some("secret".into())).oneshot(request).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_check_token_hash() {
        assert!(check_token_hash("ab12cd34", "ab12cd34"));
        assert!(!check_token_hash("ab12cd34", "ab12cd35"));
        assert!(!check_token_hash("ab12cd34", "-"));
    }
}
