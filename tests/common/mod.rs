//! Shared fixtures for router-level tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, Response};
use serde_json::Value;
use tower::ServiceExt;

use ratewrap::middleware::ApiCredential;
use ratewrap::{AppState, Config, CounterStore, MemoryStore, Quota, build_router};

pub const ALICE_KEY: &str = "alice-secret";

pub fn quota(tokens: u32, window_secs: u32) -> Option<Quota> {
    Some(Quota::new(tokens, window_secs).unwrap())
}

/// In-memory config with the given default quotas and one API key.
pub fn config(authenticated: Option<Quota>, anonymous: Option<Quota>) -> Config {
    Config {
        authenticated_quota: authenticated,
        anonymous_quota: anonymous,
        api_keys: vec![ApiCredential::new("alice", ALICE_KEY)],
        metrics_port: 0,
        ..Config::default()
    }
}

pub fn app(config: Config) -> (Router, AppState) {
    app_with_store(config, Arc::new(MemoryStore::new()))
}

pub fn app_with_store(config: Config, store: Arc<dyn CounterStore>) -> (Router, AppState) {
    let state = AppState::new(config, store);
    let router = build_router(state.clone()).expect("router should build");
    (router, state)
}

pub fn peer(ip: [u8; 4]) -> SocketAddr {
    SocketAddr::from((ip, 40000))
}

/// Request from `ip` as the server would see it after accepting a connection.
pub fn request(method: Method, uri: &str, ip: [u8; 4]) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(peer(ip)));
    req
}

pub fn get(uri: &str, ip: [u8; 4]) -> Request<Body> {
    request(Method::GET, uri, ip)
}

pub fn with_key(mut req: Request<Body>, key: &str) -> Request<Body> {
    req.headers_mut().insert("x-api-key", key.parse().unwrap());
    req
}

pub async fn send(app: &Router, req: Request<Body>) -> Response<Body> {
    app.clone().oneshot(req).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).map(|v| v.to_str().unwrap())
}

pub fn header_u64(response: &Response<Body>, name: &str) -> u64 {
    header(response, name)
        .unwrap_or_else(|| panic!("missing {name}"))
        .parse()
        .unwrap()
}
