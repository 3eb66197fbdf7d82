//! End-to-end tests against a real Redis started with testcontainers.
//!
//! These need Docker and are ignored by default:
//!
//! ```bash
//! cargo test --test redis_integration -- --ignored
//! ```
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};
use tokio::net::TcpListener;
use tokio::time::sleep;

use ratewrap::config::StoreBackend;
use ratewrap::ratelimit::{ClientKey, RedisSettings, Role};
use ratewrap::{AppState, Config, CounterStore, Quota, RateLimiter, RedisStore, build_router, connect_store};

/// Redis container configuration
struct RedisContainer;

impl RedisContainer {
    const IMAGE: &'static str = "redis";
    const TAG: &'static str = "7-alpine";
    const PORT: u16 = 6379;

    /// Start Redis and return its URL on the host
    async fn start() -> (ContainerAsync<GenericImage>, String) {
        let container = GenericImage::new(Self::IMAGE, Self::TAG)
            .with_exposed_port(Self::PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(Self::PORT)
            .await
            .expect("Failed to get Redis port");

        (container, format!("redis://127.0.0.1:{port}"))
    }
}

/// Test fixture that runs the app over a real socket against Redis
struct TestFixture {
    container: ContainerAsync<GenericImage>,
    state: AppState,
    base_url: String,
    client: Client,
}

impl TestFixture {
    async fn new(anonymous: Quota) -> Self {
        let (container, redis_url) = RedisContainer::start().await;

        let config = Config {
            store_backend: StoreBackend::Redis,
            redis_url: Some(redis_url),
            // Unique per fixture so parallel tests never share counters
            key_prefix: format!("test:{}:", uuid::Uuid::new_v4()),
            authenticated_quota: None,
            anonymous_quota: Some(anonymous),
            store_connect_attempts: 1,
            metrics_port: 0,
            ..Config::default()
        };

        let store = connect_store(&config).await.expect("Failed to connect to Redis");
        let state = AppState::new(config, store);
        let app = build_router(state.clone()).expect("Failed to build router");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            container,
            state,
            base_url: format!("http://{addr}"),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn hello(&self) -> reqwest::Response {
        self.client
            .get(self.url("/hello?name=steve"))
            .send()
            .await
            .expect("Failed to send request")
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> u64 {
    response.headers()[name].to_str().unwrap().parse().unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_counts_requests_through_redis() {
    let fixture = TestFixture::new(Quota::new(3, 60).unwrap()).await;

    for expected in [2, 1, 0] {
        let response = fixture.hello().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_u64(&response, "x-ratelimit-limit"), 3);
        assert_eq!(header_u64(&response, "x-ratelimit-remaining"), expected);

        let reset = i64::try_from(header_u64(&response, "x-ratelimit-reset")).unwrap();
        let now = Utc::now().timestamp();
        assert!(reset >= now - 1 && reset <= now + 60, "reset {reset}, now {now}");
    }

    let denied = fixture.hello().await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    assert_eq!(header_u64(&denied, "x-ratelimit-remaining"), 0);

    let health: serde_json::Value = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["store"], "redis");
    assert_eq!(health["store_connected"], true);

    fixture.state.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_requests_never_exceed_quota() {
    let fixture = Arc::new(TestFixture::new(Quota::new(10, 60).unwrap()).await);

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let fixture = fixture.clone();
            tokio::spawn(async move { fixture.hello().await.status() })
        })
        .collect();

    let mut allowed = 0;
    let mut denied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => allowed += 1,
            StatusCode::FORBIDDEN => denied += 1,
            other => panic!("unexpected status {other}"),
        }
    }

    assert_eq!(allowed, 10);
    assert_eq!(denied, 30);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_window_expires_in_redis() {
    let (_container, redis_url) = RedisContainer::start().await;
    let store: Arc<dyn CounterStore> = Arc::new(
        RedisStore::connect(&RedisSettings::new(redis_url))
            .await
            .expect("Failed to connect to Redis"),
    );
    let limiter = RateLimiter::new(store);
    let client = ClientKey::new("203.0.113.7".parse().unwrap(), Role::Anonymous);
    let quota = Quota::new(2, 1).unwrap();

    assert!(limiter.check(&client, quota, Utc::now()).await.unwrap().allowed);
    assert!(limiter.check(&client, quota, Utc::now()).await.unwrap().allowed);
    assert!(!limiter.check(&client, quota, Utc::now()).await.unwrap().allowed);

    sleep(Duration::from_millis(2100)).await;

    let decision = limiter.check(&client, quota, Utc::now()).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_store_outage_is_a_dependency_error() {
    let fixture = TestFixture::new(Quota::new(5, 60).unwrap()).await;
    assert_eq!(fixture.hello().await.status(), StatusCode::OK);

    fixture.container.stop().await.expect("Failed to stop Redis");

    let response = fixture.hello().await;
    assert!(
        matches!(
            response.status(),
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ),
        "unexpected status {}",
        response.status()
    );
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}
