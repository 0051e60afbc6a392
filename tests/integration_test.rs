use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Spawn the server on a random port and return the address.
async fn spawn_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    // Create temp db
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let db_path = tmp.path().to_path_buf();
    // Keep tmp alive by leaking it (test only)
    std::mem::forget(tmp);

    let pool = signalbox::storage::sqlite::create_pool(&signalbox::config::DatabaseConfig {
        path: db_path,
        pool_size: 2,
    })
    .unwrap();
    signalbox::storage::sqlite::init_pool(&pool).await.unwrap();

    let (tx, rx) = mpsc::channel::<signalbox::types::IngestItem>(1024);

    // Spawn worker
    let worker_pool = pool.clone();
    let pipeline_config = signalbox::config::PipelineConfig {
        flush_interval_secs: 1,
        flush_batch_size: 100,
    };
    tokio::spawn(async move {
        signalbox::pipeline::worker::run_worker(rx, worker_pool, pipeline_config).await;
    });

    let ingest_state = Arc::new(signalbox::ingest::handler::IngestState {
        config: signalbox::config::IngestConfig {
            max_payload_bytes: 65536,
            max_metadata_bytes: 4096,
            max_batch_size: 50,
            channel_capacity: 1024,
        },
        tx: tx.clone(),
    });

    let query_state = Arc::new(signalbox::query::handler::QueryState {
        pool: pool.clone(),
        cache: signalbox::query::cache::SignalCache::new(30),
        detection: signalbox::config::DetectionConfig::default(),
        channel_capacity: 1024,
        channel_tx: tx,
    });

    let dispatcher = Arc::new(
        signalbox::alert::dispatch::AlertDispatcher::new(Duration::from_secs(2)).unwrap(),
    );
    let alert_state = Arc::new(signalbox::routes::AlertState {
        pool: pool.clone(),
        dispatcher,
    });

    let app = signalbox::routes::build_router(ingest_state, query_state, alert_state, 65536, None)
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, handle)
}

/// Start of the previous hour: inside the default 24h window, and far
/// enough from an hour boundary that short bursts stay in one bucket.
fn base_ts() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    (now - 3_600_000) / 3_600_000 * 3_600_000 + 60_000
}

fn click(project: &str, session: &str, page: &str, ts: i64, metadata: serde_json::Value) -> serde_json::Value {
    json!({
        "project_id": project,
        "session_id": session,
        "page_url": page,
        "event_type": "click",
        "timestamp": ts,
        "metadata": metadata,
    })
}

async fn post_events(client: &reqwest::Client, addr: SocketAddr, events: Vec<serde_json::Value>) {
    let resp = client
        .post(format!("http://{addr}/v1/events"))
        .json(&json!({ "events": events }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["dropped"], 0);
    assert!(body["errors"].as_array().unwrap().is_empty());
}

async fn wait_for_flush() {
    // flush_interval_secs = 1
    tokio::time::sleep(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_health() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_ok"], true);
}

#[tokio::test]
async fn test_ingest_rejects_missing_session() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/v1/events"))
        .json(&json!({
            "project_id": "shop",
            "session_id": "",
            "page_url": "/",
            "event_type": "click",
            "timestamp": base_ts(),
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("session_id"));
}

#[tokio::test]
async fn test_rage_clicks_end_to_end() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let t = base_ts();

    let meta = json!({ "elementId": "buy", "className": "btn primary" });
    post_events(
        &client,
        addr,
        vec![
            click("shop", "s1", "/checkout", t, meta.clone()),
            click("shop", "s1", "/checkout", t + 500, meta.clone()),
            click("shop", "s1", "/checkout", t + 1000, meta.clone()),
            click("shop", "s1", "/checkout", t + 1500, meta.clone()),
            // Separate session, too slow to count
            click("shop", "s2", "/checkout", t, meta.clone()),
            click("shop", "s2", "/checkout", t + 5000, meta),
        ],
    )
    .await;
    wait_for_flush().await;

    let resp = client
        .get(format!("http://{addr}/v1/rage-clicks?project_id=shop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();

    let incidents = body["incidents"].as_array().unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0]["session_id"], "s1");
    assert_eq!(incidents[0]["selector"], "#buy");
    assert_eq!(incidents[0]["count"], 4);

    let spots = body["spots"].as_array().unwrap();
    assert_eq!(spots.len(), 1);
    assert_eq!(spots[0]["page_url"], "/checkout");
    assert_eq!(spots[0]["incidents"], 1);
    assert_eq!(spots[0]["clicks"], 4);
    assert_eq!(spots[0]["sessions"], 1);

    // Raising the threshold per request hides the burst
    let resp = client
        .get(format!("http://{addr}/v1/rage-clicks?project_id=shop&threshold=5"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["incidents"].as_array().unwrap().is_empty());

    let resp = client
        .get(format!("http://{addr}/v1/trends/rage?project_id=shop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let trend: Vec<serde_json::Value> = resp.json().await.unwrap();
    let total: u64 = trend.iter().map(|h| h["count"].as_u64().unwrap()).sum();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_dead_clicks_end_to_end() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let t = base_ts();

    let mut submit = click("shop", "s1", "/form", t + 500, json!({}));
    submit["event_type"] = json!("submit");

    post_events(
        &client,
        addr,
        vec![
            // Rescued by a submit
            click("shop", "s1", "/form", t, json!({ "elementId": "send" })),
            submit,
            // Nothing follows
            click("shop", "s1", "/form", t + 10_000, json!({ "className": "banner" })),
        ],
    )
    .await;
    wait_for_flush().await;

    let resp = client
        .get(format!("http://{addr}/v1/dead-clicks?project_id=shop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();

    let dead = body["dead_clicks"].as_array().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["selector"], ".banner");
    assert_eq!(body["spots"][0]["incidents"], 1);
}

#[tokio::test]
async fn test_dead_clicks_page_filter_keeps_cross_page_reactions() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let t = base_ts();

    let pageview = |page: &str, ts: i64| {
        json!({
            "project_id": "shop",
            "session_id": "s1",
            "page_url": page,
            "event_type": "pageview",
            "timestamp": ts,
        })
    };

    post_events(
        &client,
        addr,
        vec![
            // Link on /home navigates to /pricing
            click("shop", "s1", "/home", t, json!({ "elementId": "pricing-link" })),
            pageview("/pricing", t + 300),
            // Same millisecond on another page: insertion order decides
            click("shop", "s1", "/zeta", t + 20_000, json!({ "elementId": "go" })),
            pageview("/alpha", t + 20_000),
            // Genuinely dead
            click("shop", "s1", "/home", t + 40_000, json!({ "className": "hero" })),
        ],
    )
    .await;
    wait_for_flush().await;

    let resp = client
        .get(format!("http://{addr}/v1/dead-clicks?project_id=shop&page_url=/home"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let dead = body["dead_clicks"].as_array().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["selector"], ".hero");
    assert_eq!(dead[0]["page_url"], "/home");

    let resp = client
        .get(format!("http://{addr}/v1/dead-clicks?project_id=shop&page_url=/zeta"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["dead_clicks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_error_grouping_end_to_end() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let t = base_ts();

    for (i, line) in ["10:5", "42:17"].iter().enumerate() {
        let resp = client
            .post(format!("http://{addr}/v1/performance"))
            .json(&json!({
                "project_id": "shop",
                "session_id": format!("s{i}"),
                "page_url": "/cart",
                "timestamp": t + i as i64 * 1000,
                "lcp": 2100.0,
                "js_errors": [{
                    "name": "TypeError",
                    "message": "x is undefined",
                    "stack": format!("TypeError: x is undefined\n    at render (https://cdn.example.com/app.js:{line})"),
                }],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    wait_for_flush().await;

    let resp = client
        .get(format!("http://{addr}/v1/errors?project_id=shop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let groups: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["name"], "TypeError");
    assert_eq!(groups[0]["count"], 2);
    assert_eq!(groups[0]["sessions"].as_array().unwrap().len(), 2);

    let resp = client
        .get(format!("http://{addr}/v1/trends/errors?project_id=shop"))
        .send()
        .await
        .unwrap();
    let trend: Vec<serde_json::Value> = resp.json().await.unwrap();
    let total: u64 = trend.iter().map(|h| h["count"].as_u64().unwrap()).sum();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_heatmap_computes_and_stores_aggregate() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let t = base_ts();

    post_events(
        &client,
        addr,
        vec![
            click("shop", "s1", "/home", t, json!({ "x": 100, "y": 100 })),
            click("shop", "s1", "/home", t + 10, json!({ "x": 105, "y": 102 })),
            click("shop", "s2", "/home", t + 20, json!({ "x": 400, "y": 300 })),
            // No coordinates: skipped
            click("shop", "s2", "/home", t + 30, json!({ "elementId": "nav" })),
        ],
    )
    .await;
    wait_for_flush().await;

    // The stored aggregate does not exist until the heatmap is computed once
    let resp = client
        .get(format!("http://{addr}/v1/heatmap/latest?project_id=shop&page_url=/home"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(format!("http://{addr}/v1/heatmap?project_id=shop&page_url=/home&type=click"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["point_count"], 3);
    let clusters = body["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0]["count"], 2);
    assert_eq!(clusters[0]["relative"], 1.0);
    assert_eq!(clusters[1]["relative"], 0.5);

    let resp = client
        .get(format!("http://{addr}/v1/heatmap/latest?project_id=shop&page_url=/home"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stored: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stored["device"], "all");
    assert_eq!(stored["point_count"], 3);
    assert_eq!(stored["clusters"].as_array().unwrap().len(), 2);

    // page_url is required
    let resp = client
        .get(format!("http://{addr}/v1/heatmap?project_id=shop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_alert_crud() {
    let (addr, _handle) = spawn_server().await;
    let client = reqwest::Client::new();

    // Private webhook hosts are rejected
    let resp = client
        .post(format!("http://{addr}/v1/alerts"))
        .json(&json!({
            "name": "Traffic spike",
            "metric": "events_per_minute",
            "comparator": ">",
            "threshold": 100,
            "channel": { "type": "webhook", "url": "http://127.0.0.1:9000/hook" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown metrics are rejected
    let resp = client
        .post(format!("http://{addr}/v1/alerts"))
        .json(&json!({
            "name": "Memory",
            "metric": "memory_p75",
            "comparator": ">",
            "threshold": 1,
            "channel": { "type": "webhook", "url": "https://example.com/hook" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Windows longer than 30 days are rejected
    let resp = client
        .post(format!("http://{addr}/v1/alerts"))
        .json(&json!({
            "name": "Forever",
            "metric": "events_per_minute",
            "comparator": ">",
            "threshold": 1,
            "window_minutes": 9_223_372_036_854_775i64,
            "channel": { "type": "webhook", "url": "https://example.com/hook" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("http://{addr}/v1/alerts"))
        .json(&json!({
            "name": "Slow LCP",
            "project_id": "shop",
            "metric": "lcp_p75",
            "comparator": ">=",
            "threshold": 2500,
            "window_minutes": 15,
            "channel": { "type": "slack", "webhook_url": "https://hooks.slack.com/services/T/B/X" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let rule: serde_json::Value = resp.json().await.unwrap();
    let id = rule["id"].as_i64().unwrap();
    assert_eq!(rule["comparator"], ">=");
    assert_eq!(rule["window_minutes"], 15);
    assert_eq!(rule["cooldown_ms"], 300_000);
    assert_eq!(rule["enabled"], true);
    assert!(rule["last_triggered_at"].is_null());

    let resp = client
        .get(format!("http://{addr}/v1/alerts"))
        .send()
        .await
        .unwrap();
    let rules: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0]["channel"]["type"], "slack");

    let resp = client
        .put(format!("http://{addr}/v1/alerts/{id}"))
        .json(&json!({ "threshold": 4000, "enabled": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let updated: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(updated["threshold"], 4000.0);
    assert_eq!(updated["enabled"], false);
    assert_eq!(updated["name"], "Slow LCP");

    let resp = client
        .delete(format!("http://{addr}/v1/alerts/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .delete(format!("http://{addr}/v1/alerts/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
