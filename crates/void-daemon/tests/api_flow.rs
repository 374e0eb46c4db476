//! End-to-end flows through the API router backed by a real engine with a
//! scripted resolver and a no-op reloader.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use void_core::api::StatusResponse;
use void_core::pf::{PfManager, ReloaderError, RuleReloader};
use void_core::resolver::{Resolver, ResolverError};
use void_core::rules::Rule;
use void_daemon::engine::Engine;
use void_daemon::server;

struct StaticResolver {
    ips: Vec<IpAddr>,
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup_host(&self, _hostname: &str) -> Result<Vec<IpAddr>, ResolverError> {
        Ok(self.ips.clone())
    }
}

#[derive(Default)]
struct NoopReloader {
    calls: Mutex<usize>,
}

#[async_trait]
impl RuleReloader for NoopReloader {
    async fn run(&self, _program: &str, _args: &[String]) -> Result<(), ReloaderError> {
        *self.calls.lock().unwrap() += 1;
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    router: axum::Router,
    anchor_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let anchor_path = dir.path().join("void");
    let resolver = Arc::new(StaticResolver {
        ips: vec!["1.2.3.4".parse().unwrap(), "2001:db8::1".parse().unwrap()],
    });
    let pf = PfManager::with_anchor_path(&anchor_path, Arc::new(NoopReloader::default()));
    let mut engine = Engine::new(pf, resolver, Duration::from_secs(300));
    let handle = engine.handle();
    engine.run();

    Harness {
        engine,
        router: server::router(handle),
        anchor_path,
        _dir: dir,
    }
}

async fn send(router: &axum::Router, method: Method, path: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn rules(router: &axum::Router) -> Vec<Rule> {
    let (status, body) = send(router, Method::GET, "/v1/rules", None).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

async fn wait_for_rules(router: &axum::Router, count: usize) -> Vec<Rule> {
    for _ in 0..500 {
        let current = rules(router).await;
        if current.len() == count {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("rule count never reached {count}");
}

#[tokio::test]
async fn block_then_list() {
    let mut h = harness();

    let ttl_2h = 2 * 3600 * 1_000_000_000u64;
    let (status, _) = send(
        &h.router,
        Method::POST,
        "/v1/block",
        Some(&format!(r#"{{"domain":"example.com","ttl":{ttl_2h}}}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let listed = wait_for_rules(&h.router, 1).await;
    let rule = &listed[0];
    assert_eq!(rule.domain, "example.com");
    assert_eq!(rule.ips.len(), 2);
    assert!(!rule.permanent);
    let expires = rule.expires.unwrap();
    let expected = chrono::Utc::now() + chrono::Duration::hours(2);
    assert!((expires - expected).num_seconds().abs() < 60);

    h.engine.close().await;
}

#[tokio::test]
async fn block_then_unblock() {
    let mut h = harness();

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/v1/block",
        Some(r#"{"domain":"x.com"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let listed = wait_for_rules(&h.router, 1).await;
    assert!(listed[0].permanent);
    let id = listed[0].id.clone();

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/v1/unblock",
        Some(&format!(r#"{{"id":"{id}"}}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    wait_for_rules(&h.router, 0).await;

    // The anchor file ends up with the header only.
    let anchor = std::fs::read_to_string(&h.anchor_path).unwrap();
    assert!(!anchor.contains("VOID-RULE"));

    h.engine.close().await;
}

#[tokio::test]
async fn block_requires_domain() {
    let mut h = harness();

    let (status, body) = send(&h.router, Method::POST, "/v1/block", Some("{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"domain required");

    h.engine.close().await;
}

#[tokio::test]
async fn unblock_requires_id() {
    let mut h = harness();

    let (status, body) = send(&h.router, Method::POST, "/v1/unblock", Some("{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"id required");

    h.engine.close().await;
}

#[tokio::test]
async fn status_reports_counts_and_build_info() {
    let mut h = harness();

    let (status, body) = send(&h.router, Method::GET, "/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);

    let parsed: StatusResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.rules, 0);
    assert_eq!(parsed.version, env!("CARGO_PKG_VERSION"));
    assert!(!parsed.commit.is_empty());

    h.engine.close().await;
}
