//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, Response},
    Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use request_guard::{GuardConfig, GuardServer, Shutdown};

/// Defaults with an ephemeral bind address.
pub fn test_config() -> GuardConfig {
    let mut config = GuardConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config
}

pub fn app(config: GuardConfig) -> Router {
    GuardServer::new(config).unwrap().router()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// `name=value` from the first `Set-Cookie` header.
pub fn session_cookie<B>(response: &Response<B>) -> String {
    response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

/// A session cookie and a token for it, fetched through the router.
pub async fn session_with_token(app: &Router) -> (String, String) {
    use tower::ServiceExt;

    let response = app.clone().oneshot(get("/session/token")).await.unwrap();
    let cookie = session_cookie(&response);
    let body = body_json(response).await;
    (cookie, body["token"].as_str().unwrap().to_string())
}

/// Run a server on an ephemeral port.
pub async fn start_server(config: GuardConfig) -> (SocketAddr, Shutdown, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GuardServer::new(config).unwrap();
    let shutdown = Shutdown::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            server.run(listener, shutdown).await.unwrap();
        })
    };
    (addr, shutdown, handle)
}
