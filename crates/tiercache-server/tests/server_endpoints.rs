use std::sync::Arc;

use serde_json::{Value, json};
use tiercache_engine::{CacheEngine, CacheStrategy, EngineConfig, MemoryStore, NodeConfig, SetOptions};
use tiercache_server::{AppConfig, ServerBuilder, build_app};
use tokio::task::JoinHandle;

fn memory_engine(config: EngineConfig) -> CacheEngine {
    let store = Arc::new(MemoryStore::new(config.store.default_ttl()));
    CacheEngine::new(config, store).expect("engine")
}

async fn start_server(
    engine: CacheEngine,
) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let app = build_app(engine, &AppConfig::default());

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, server)
}

#[tokio::test]
async fn peer_protocol_round_trip() {
    let engine = memory_engine(EngineConfig::default());
    let (base, shutdown_tx, handle) = start_server(engine.clone()).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // Unknown key
    let resp = client
        .get(format!("{base}/cache/user%3A1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // PUT then GET
    let resp = client
        .put(format!("{base}/cache/user%3A1"))
        .json(&json!({"value": {"name": "Ann"}, "ttl": 60}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client
        .get(format!("{base}/cache/user%3A1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["value"], json!({"name": "Ann"}));

    // The stored value is visible to the local engine as well
    let local: Option<Value> = engine.get("user:1", "default").await.unwrap();
    assert_eq!(local, Some(json!({"name": "Ann"})));

    // DELETE
    let resp = client
        .delete(format!("{base}/cache/user%3A1"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let resp = client
        .get(format!("{base}/cache/user%3A1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Malformed body is rejected by the extractor
    let resp = client
        .put(format!("{base}/cache/broken"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn admin_endpoints() {
    let engine = memory_engine(EngineConfig::default());
    engine
        .register_strategy("user", CacheStrategy::with_ttl(60))
        .unwrap();
    let (base, shutdown_tx, handle) = start_server(engine.clone()).await;
    let client = reqwest::Client::new();

    engine
        .set_with(
            "user:1:profile",
            &json!({"bio": "hi"}),
            "user",
            SetOptions::default().depends_on("user:1"),
        )
        .await
        .unwrap();
    let _: Option<Value> = engine.get("user:1:profile", "user").await.unwrap();

    // Metrics per strategy
    let resp = client
        .get(format!("{base}/admin/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["user"]["hits"], 1);
    assert_eq!(body["user"]["sets"], 1);

    // Invalidate by token
    let resp = client
        .post(format!("{base}/admin/invalidate/user%3A1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["token"], "user:1");
    assert_eq!(body["invalidated"], 1);
    let gone: Option<Value> = engine.get("user:1:profile", "user").await.unwrap();
    assert_eq!(gone, None);

    // Reset
    let resp = client
        .delete(format!("{base}/admin/metrics"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let resp = client
        .get(format!("{base}/admin/metrics"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert!(body.get("user").is_none_or(|m| m["hits"] == 0));

    // Nodes listing
    let resp = client
        .get(format!("{base}/admin/nodes"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!([]));

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn prometheus_endpoint_reports_nodes() {
    tiercache_server::metrics::init_metrics();
    let engine = memory_engine(EngineConfig::default());
    let (base, shutdown_tx, handle) = start_server(engine).await;

    let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("cache_nodes"));

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn read_through_between_two_nodes() {
    // Node B owns the value
    let node_b = memory_engine(EngineConfig::default());
    node_b
        .register_strategy("user", CacheStrategy::with_ttl(60))
        .unwrap();
    node_b
        .set("user:7", &json!({"name": "Kim"}), "user")
        .await
        .unwrap();
    let (base_b, shutdown_b, handle_b) = start_server(node_b.clone()).await;

    // Node A only knows B as a peer
    let mut config_a = EngineConfig::default();
    config_a.nodes.push(NodeConfig {
        id: "node-b".into(),
        url: base_b.clone(),
        region: "local".into(),
    });
    config_a
        .strategies
        .insert("user".into(), CacheStrategy::with_ttl(60));
    let node_a = memory_engine(config_a);

    let value: Option<Value> = node_a.get("user:7", "user").await.unwrap();
    assert_eq!(value, Some(json!({"name": "Kim"})));
    assert_eq!(node_a.metrics("user").hits, 1);

    // Written through to A's own store: B going away does not matter
    let _ = shutdown_b.send(());
    let _ = handle_b.await;
    let again: Option<Value> = node_a.get("user:7", "user").await.unwrap();
    assert_eq!(again, Some(json!({"name": "Kim"})));

    let missing: Option<Value> = node_a.get("user:8", "user").await.unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn run_reports_bind_failure() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut cfg = AppConfig::default();
    cfg.server.host = "127.0.0.1".into();
    cfg.server.port = port;
    let server = ServerBuilder::new().with_config(cfg).build().await.unwrap();

    let err = server.run().await.unwrap_err();
    assert!(err.downcast_ref::<std::io::Error>().is_some());
}
