//! End-to-end behavior of the public and admin HTTP surfaces.

use reqwest::StatusCode;
use serde_json::Value;
use tenant_gateway::admin::setup_admin_router;
use tenant_gateway::config::RateClassConfig;
use tokio::net::TcpListener;

mod common;

#[tokio::test]
async fn test_unidentified_callers_are_rejected_before_dispatch() {
    let backend = common::start_mock_backend(200, "{}").await;
    let mut config = common::base_config();
    config.backends.push(common::backend("users", &backend.url()));
    config.routes.push(common::route("users", "/api/users", "users"));
    let gateway = common::spawn_gateway(config).await;

    let res = reqwest::get(gateway.url("/api/users/1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn test_unknown_path_is_json_not_found() {
    let mut config = common::base_config();
    config.backends.push(common::backend("users", "http://127.0.0.1:1"));
    config.routes.push(common::route("users", "/api/users", "users"));
    let gateway = common::spawn_gateway(config).await;

    let res = common::client_for("alice", "acme")
        .get(gateway.url("/api/orders"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "no_route");
}

#[tokio::test]
async fn test_forwarded_request_carries_identity_and_request_id() {
    let backend = common::start_mock_backend(200, r#"{"ok":true}"#).await;
    let mut config = common::base_config();
    config.backends.push(common::backend("users", &backend.url()));
    config.routes.push(common::route("users", "/api/users", "users"));
    let gateway = common::spawn_gateway(config).await;

    let res = common::client_for("alice", "acme")
        .get(gateway.url("/api/users/42?expand=roles"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let request_id = res.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(!request_id.is_empty());
    assert_eq!(res.headers()["x-cache"], "MISS");
    assert_eq!(res.headers()["x-circuit-state"], "closed");

    let head = backend.requests().pop().unwrap().to_ascii_lowercase();
    assert!(head.starts_with("get /42?expand=roles http/1.1"));
    assert!(head.contains("x-user-id: alice"));
    assert!(head.contains("x-tenant-id: acme"));
    assert!(head.contains(&format!("x-request-id: {}", request_id.to_ascii_lowercase())));
}

#[tokio::test]
async fn test_rate_limit_per_identity() {
    let backend = common::start_mock_backend(200, "{}").await;
    let mut config = common::base_config();
    config
        .rate_limit
        .classes
        .insert("default".into(), RateClassConfig { limit: 2, window_secs: 60 });
    config.backends.push(common::backend("users", &backend.url()));
    config.routes.push(common::route("users", "/api/users", "users"));
    let gateway = common::spawn_gateway(config).await;

    let alice = common::client_for("alice", "acme");
    for remaining in ["1", "0"] {
        let res = alice.get(gateway.url("/api/users")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-ratelimit-remaining"], remaining);
    }

    let res = alice.get(gateway.url("/api/users")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers().contains_key("retry-after"));
    assert_eq!(backend.hits(), 2);

    let bob = common::client_for("bob", "acme");
    let res = bob.get(gateway.url("/api/users")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cached_reads_and_write_invalidation() {
    let backend = common::start_programmable_backend(|head| async move {
        if head.starts_with("POST") {
            (201, r#"{"id":2}"#.to_string())
        } else {
            (200, r#"[{"id":1}]"#.to_string())
        }
    })
    .await;

    let mut config = common::base_config();
    config.backends.push(common::backend("users", &backend.url()));
    let mut route = common::route("users", "/api/users", "users");
    route.cache_ttl_secs = Some(60);
    route.cache_tags = vec!["users".into()];
    route.invalidate_tags = vec!["users".into()];
    config.routes.push(route);
    let gateway = common::spawn_gateway(config).await;
    let client = common::client_for("alice", "acme");

    let first = client.get(gateway.url("/api/users")).send().await.unwrap();
    assert_eq!(first.headers()["x-cache"], "MISS");
    let second = client.get(gateway.url("/api/users")).send().await.unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");
    assert_eq!(second.text().await.unwrap(), r#"[{"id":1}]"#);
    assert_eq!(backend.hits(), 1);

    // Another tenant never sees acme's cached entry
    let other = common::client_for("carol", "globex");
    let res = other.get(gateway.url("/api/users")).send().await.unwrap();
    assert_eq!(res.headers()["x-cache"], "MISS");
    assert_eq!(backend.hits(), 2);

    let res = client
        .post(gateway.url("/api/users"))
        .json(&serde_json::json!({"name": "dave"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let after = client.get(gateway.url("/api/users")).send().await.unwrap();
    assert_eq!(after.headers()["x-cache"], "MISS");
    assert_eq!(backend.hits(), 4);

    let stats = gateway.state.dispatcher.cache().stats();
    assert_eq!(stats.hits, 1);
    assert!(!stats.degraded);
}

#[tokio::test]
async fn test_admin_surface() {
    let backend = common::start_mock_backend(200, "{}").await;
    let mut config = common::base_config();
    config.admin.api_key = "admin-secret".into();
    config.backends.push(common::backend("users", &backend.url()));
    let mut route = common::route("users", "/api/users", "users");
    route.cache_ttl_secs = Some(60);
    config.routes.push(route);
    let gateway = common::spawn_gateway(config).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin = listener.local_addr().unwrap();
    let router = setup_admin_router(gateway.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    common::client_for("alice", "acme")
        .get(gateway.url("/api/users"))
        .send()
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let res = http.get(format!("http://{}/admin/overview", admin)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = http
        .get(format!("http://{}/admin/overview", admin))
        .bearer_auth("admin-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let overview: Value = res.json().await.unwrap();
    assert_eq!(overview["open_circuits"], 0);
    assert_eq!(overview["circuits"][0]["backend"], "users");
    assert_eq!(overview["cache"]["misses"], 1);

    let res = http
        .post(format!("http://{}/admin/cache/flush", admin))
        .bearer_auth("admin-secret")
        .send()
        .await
        .unwrap();
    let flushed: Value = res.json().await.unwrap();
    assert_eq!(flushed["removed"], 1);

    let res = http
        .post(format!("http://{}/admin/circuits/reset", admin))
        .bearer_auth("admin-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = http
        .post(format!("http://{}/admin/circuits/nope/reset", admin))
        .bearer_auth("admin-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
