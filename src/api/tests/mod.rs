use crate::api::create_router;
use crate::config::Config;
use crate::downloader::NetConfig;
use crate::mirror::Mirror;
use crate::mirror::test_helpers::FailingDownloader;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use std::sync::Arc;


/// A router over a fresh mirror with a temp topic root.
pub(crate) async fn test_app(token: Option<&str>) -> (Router, Mirror, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.downloader.topic_root = Some(temp.path().to_path_buf());
    config.server.token = token.map(String::from);
    let mirror = Mirror::new(config, NetConfig::default(), Arc::new(FailingDownloader))
        .await
        .expect("test mirror");
    (create_router(mirror.clone()), mirror, temp)
}

pub(crate) fn request(method: &str, uri: &str, body: Option<&str>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

pub(crate) async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}
