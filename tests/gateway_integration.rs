//! End-to-end scenarios driven through the Gateway Facade's `axum::Router`
//! against the in-process `DemoTransport`, exercising the router directly via
//! `oneshot` rather than a real TCP listener.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use perp_gateway::config::{Config, Network};
use perp_gateway::gateway::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_addr() -> SocketAddr {
    "127.0.0.1:9"
        .parse()
        .expect("static socket addr literal parses")
}

fn test_config() -> Config {
    Config {
        private_key: None,
        network: Network::Testnet,
        port: 0,
        price_poll_interval: Duration::from_secs(3600), // tests drive polling manually
        upstream_timeout: Duration::from_secs(5),
        asset_id_cache_ttl: Duration::from_secs(300),
    }
}

async fn test_app() -> Router {
    let state = AppState::bootstrap(test_config());
    state.price_tape.poll_once().await.expect("seed poll succeeds");
    perp_gateway::gateway::router(state)
}

async fn call(app: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request_body = match &body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .extension(ConnectInfo(test_addr()));
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let request = builder.body(request_body).unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_initialized_and_network() {
    let app = test_app().await;
    let (status, body) = call(&app, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["initialized"], true);
    assert_eq!(body["network"], "testnet");
}

/// A 30-minute, 5-sub BTC TWAP whose unit count isn't evenly divisible by 5
/// front-loads the remainder onto the earliest sub-orders, and sub-order 0
/// executes synchronously as part of `create`.
#[tokio::test]
async fn btc_five_sub_twap_distributes_and_runs_first_leg() {
    let app = test_app().await;
    // 122 units of the 0.00001 BTC size-tick: 122 / 5 = 24 remainder 2, so
    // the first two sub-orders get 25 units and the rest get 24 — the same
    // front-loaded-remainder shape as a [3,3,2,2,2] unit split.
    let (status, body) = call(
        &app,
        "POST",
        "/api/place-twap-order",
        Some(json!({
            "symbol": "BTC-PERP",
            "side": "buy",
            "totalSize": "0.00122",
            "durationMinutes": 30,
            "intervals": 5,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let task = &body["task"];
    assert_eq!(task["status"], "active");

    let sizes: Vec<&str> = task["subOrderSizes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(sizes, vec!["0.00025", "0.00025", "0.00024", "0.00024", "0.00024"]);
    let total: f64 = sizes.iter().map(|s| s.parse::<f64>().unwrap()).sum();
    assert!((total - 0.00122).abs() < 1e-9);
    assert_eq!(task["results"].as_array().unwrap().len(), 1);
}

/// A DOGE TWAP with totalSize=1, intervals=2 against DOGE's zero-decimal
/// size tick yields too few whole units to distribute.
#[tokio::test]
async fn doge_twap_too_small_is_rejected_before_any_task_is_stored() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/place-twap-order",
        Some(json!({
            "symbol": "DOGE-PERP",
            "side": "buy",
            "totalSize": "1",
            "durationMinutes": 5,
            "intervals": 2,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "twap_size_too_small");

    let (_, list) = call(&app, "GET", "/api/twap-tasks", None).await;
    assert_eq!(list["totalTasks"], 0);
}

/// A limit order priced far enough from mid to breach the 80% deviation
/// ceiling is rejected with a suggested corrective price.
#[tokio::test]
async fn far_off_limit_price_is_rejected_with_suggested_price() {
    let app = test_app().await;
    let (_, prices) = call(&app, "GET", "/api/prices", None).await;
    let mid: f64 = prices["prices"]["SOL-PERP"]["price"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let (status, body) = call(
        &app,
        "POST",
        "/api/place-order",
        Some(json!({
            "symbol": "SOL-PERP",
            "side": "buy",
            "size": "1",
            "price": (mid * 3.0).to_string(),
            "tif": "gtc",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "price_deviation");
    assert!(body["details"]["suggestedPrice"].is_string());
}

/// An entry + TP + SL batch groups as `normalTpsl`, with the entry always
/// at index 0 and both triggers forced reduce-only.
#[tokio::test]
async fn grouped_tp_sl_batch_submits_as_normal_tpsl() {
    let app = test_app().await;
    // TP/SL triggerPx still has to clear the order pipeline's 80% deviation
    // band against the live mid, so derive them from it rather than using an
    // arbitrary fixed entry price.
    let (_, prices) = call(&app, "GET", "/api/prices", None).await;
    let mid: f64 = prices["prices"]["BTC-PERP"]["price"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let entry = mid;
    let tp = mid * 1.2;
    let sl = mid * 0.9;

    let (status, body) = call(
        &app,
        "POST",
        "/api/place-order",
        Some(json!([
            {
                "symbol": "BTC-PERP",
                "side": "buy",
                "size": "0.001",
                "price": entry.to_string(),
                "tif": "gtc",
            },
            {
                "symbol": "BTC-PERP",
                "side": "sell",
                "size": "0.001",
                "reduceOnly": true,
                "triggerPx": tp.to_string(),
                "isMarket": false,
                "tpsl": "tp",
            },
            {
                "symbol": "BTC-PERP",
                "side": "sell",
                "size": "0.001",
                "reduceOnly": true,
                "triggerPx": sl.to_string(),
                "isMarket": true,
                "tpsl": "sl",
            },
        ])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let statuses = body["response"]["data"]["statuses"].as_array().unwrap();
    assert_eq!(statuses.len(), 3);
}

/// A reduceOnly trigger batch member that isn't actually reduceOnly is
/// rejected before any upstream call.
#[tokio::test]
async fn trigger_child_missing_reduce_only_is_rejected() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/place-order",
        Some(json!([
            {
                "symbol": "ETH-PERP",
                "side": "buy",
                "size": "0.1",
                "price": "3000",
                "tif": "gtc",
            },
            {
                "symbol": "ETH-PERP",
                "side": "sell",
                "size": "0.1",
                "reduceOnly": false,
                "triggerPx": "3500",
                "isMarket": false,
                "tpsl": "tp",
            },
        ])),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

/// Cancelling an active TWAP task stops further sub-order execution;
/// already-recorded results are untouched and no further results are
/// appended once the remaining timers fire.
#[tokio::test]
async fn cancel_mid_run_freezes_results_and_suppresses_remaining_timers() {
    let app = test_app().await;
    let (_, created) = call(
        &app,
        "POST",
        "/api/place-twap-order",
        Some(json!({
            "symbol": "BTC-PERP",
            "side": "buy",
            "totalSize": "0.0005",
            "durationMinutes": 5,
            "intervals": 5,
        })),
    )
    .await;
    let task_id = created["taskId"].as_u64().unwrap();

    let (status, cancelled) = call(
        &app,
        "POST",
        &format!("/api/cancel-twap-task/{task_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["success"], true);

    let (_, task) = call(&app, "GET", &format!("/api/twap-task/{task_id}"), None).await;
    assert_eq!(task["task"]["status"], "cancelled");
    let results_at_cancel = task["task"]["results"].as_array().unwrap().len();
    assert_eq!(results_at_cancel, 1);

    // Remaining scheduled timers (intervals 1..4) should be no-ops: they
    // observe the cancelled status and append nothing further.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let (_, task_after) = call(&app, "GET", &format!("/api/twap-task/{task_id}"), None).await;
    assert_eq!(
        task_after["task"]["results"].as_array().unwrap().len(),
        results_at_cancel
    );

    let second_cancel = call(
        &app,
        "POST",
        &format!("/api/cancel-twap-task/{task_id}"),
        None,
    )
    .await;
    assert_eq!(second_cancel.0, StatusCode::CONFLICT);
}

#[tokio::test]
async fn twap_not_found_returns_404() {
    let app = test_app().await;
    let (status, body) = call(&app, "GET", "/api/twap-task/999999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "twap_not_found");
}

#[tokio::test]
async fn switch_network_clears_and_reprimes_snapshot() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/switch-network",
        Some(json!({ "network": "mainnet" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["network"], "mainnet");

    let (_, health) = call(&app, "GET", "/api/health", None).await;
    assert_eq!(health["network"], "mainnet");
}
