mod common;

use std::sync::Arc;
use std::time::Duration;

use allocation_workbench::models::AllocationProposal;
use common::{TestApp, PARTNER_A, PARTNER_B};
use serde_json::json;

#[tokio::test]
async fn health_and_status_respond() {
    let app = TestApp::new();

    let (status, body) = app.get("/api/v1/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["table_phase"]["state"], "idle");

    let (status, body) = app.get("/api/v1/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["service"], "allocation-workbench");
    assert_eq!(body["data"]["environment"], "test");
}

#[tokio::test]
async fn load_passes_paging_and_filters_upstream() {
    let app = TestApp::new();

    let (status, body) = app
        .post(
            "/api/v1/table/load",
            json!({ "page": 3, "page_size": 5000, "filters": { "partner": "10" } }),
        )
        .await;

    assert_eq!(status, 200);
    let fetches = app.upstream.fetches.lock().unwrap().clone();
    assert_eq!(fetches.len(), 1);
    // page size is clamped to the configured maximum
    assert_eq!(fetches[0].0, 200);
    assert_eq!(fetches[0].1, 3);
    assert_eq!(
        fetches[0].2.iter().collect::<Vec<_>>(),
        vec![(&"partner".to_string(), &"10".to_string())]
    );
    assert_eq!(body["data"]["pagination"]["page"], 3);
    assert_eq!(body["data"]["table"]["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn load_rejects_a_zero_page() {
    let app = TestApp::new();
    let (status, body) = app.post("/api/v1/table/load", json!({ "page": 0 })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Bad Request");
}

#[tokio::test]
async fn suggest_preview_and_keep_round_trip() {
    let app = TestApp::new();
    app.load().await;
    app.upstream
        .suggesting(vec![AllocationProposal::assign(11, PARTNER_A)]);

    let (status, body) = app.post("/api/v1/table/suggest", json!({})).await;
    assert_eq!(status, 200);
    let data = &body["data"];
    assert_eq!(data["result"]["outcome"], "previewing");
    assert_eq!(data["result"]["suggestions"][0]["line_item_id"], 11);
    assert_eq!(data["table"]["phase"]["state"], "previewing");
    assert_eq!(data["table"]["interaction_mode"], true);
    assert_eq!(
        data["table"]["items"][0]["items"][0]["allocation"]["status"],
        "proposed"
    );
    assert_eq!(data["table"]["items"][0]["requests"][0]["items_allocated"], 2);
    assert_eq!(data["toasts"][0]["level"], "info");

    let (_, changes) = app.get("/api/v1/table/changes").await;
    assert_eq!(changes["data"].as_array().unwrap().len(), 1);
    assert_eq!(changes["data"][0]["lineItemId"], 11);

    let fetches_before_keep = app.upstream.fetch_count();
    let (status, body) = app.post("/api/v1/table/keep", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["result"]["outcome"], "saved");
    assert_eq!(body["data"]["result"]["applied"], 1);
    assert_eq!(body["data"]["table"]["interaction_mode"], false);
    // keep reloads so stored allocations replace proposed ones
    assert_eq!(app.upstream.fetch_count(), fetches_before_keep + 1);
    assert_eq!(body["data"]["table"]["needs_refresh"], false);
}

#[tokio::test]
async fn suggest_with_nothing_loaded_is_skipped() {
    let app = TestApp::new();
    let (status, body) = app.post("/api/v1/table/suggest", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["result"]["outcome"], "skipped");
}

#[tokio::test]
async fn undo_restores_loaded_items() {
    let app = TestApp::new();
    let loaded = app.load().await;
    app.upstream
        .suggesting(vec![AllocationProposal::assign(11, PARTNER_B)]);
    app.post("/api/v1/table/suggest", json!({})).await;

    let (status, body) = app.post("/api/v1/table/undo", json!({})).await;

    assert_eq!(status, 200);
    assert_eq!(body["data"]["result"]["restored"], true);
    assert_eq!(body["data"]["table"]["items"], loaded["data"]["table"]["items"]);
    assert_eq!(body["data"]["table"]["phase"]["state"], "idle");
}

#[tokio::test]
async fn cancel_while_generating_drops_the_late_result() {
    let app = Arc::new(TestApp::new());
    let loaded = app.load().await;
    app.upstream
        .suggesting(vec![AllocationProposal::assign(11, PARTNER_B)]);
    let gate = app.upstream.hold_suggestions();

    let suggest = {
        let app = app.clone();
        tokio::spawn(async move { app.post("/api/v1/table/suggest", json!({})).await })
    };
    app.upstream.suggest_started.notified().await;

    let (_, during) = app.get("/api/v1/table").await;
    assert_eq!(during["data"]["table"]["phase"]["state"], "processing");
    assert_eq!(during["data"]["table"]["phase"]["stage"], "generating");

    let (_, cancelled) = app.post("/api/v1/table/cancel", json!({})).await;
    assert_eq!(cancelled["data"]["result"]["restored"], true);

    gate.notify_one();
    let (status, body) = suggest.await.expect("suggest task");

    assert_eq!(status, 200);
    assert_eq!(body["data"]["result"]["outcome"], "stale");
    assert_eq!(body["data"]["table"]["interaction_mode"], false);
    assert_eq!(body["data"]["table"]["items"], loaded["data"]["table"]["items"]);
}

#[tokio::test]
async fn chip_selection_allocates_through_the_api() {
    let app = TestApp::new();
    app.load().await;

    let (status, body) = app
        .post(
            "/api/v1/table/items/1/line-items/11/select",
            json!({ "action": "partner", "partner_id": PARTNER_B }),
        )
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["data"]["result"]["changed"], true);
    let line = &body["data"]["table"]["items"][0]["items"][0];
    assert_eq!(line["allocation"]["status"], "persisted");
    assert_eq!(line["allocation"]["partner"]["id"], PARTNER_B);
    assert_eq!(body["data"]["toasts"][0]["level"], "success");
    assert_eq!(
        app.upstream.created.lock().unwrap().as_slice(),
        &[(None, PARTNER_B, 11)]
    );
}

#[tokio::test]
async fn chip_selection_routes_through_distributions_when_configured() {
    let mut config = common::test_config();
    config.allocate_into_distributions = true;
    let app = TestApp::with_config(config);
    app.load().await;

    let (status, _) = app
        .post(
            "/api/v1/table/items/1/line-items/11/select",
            json!({ "action": "partner", "partner_id": PARTNER_A }),
        )
        .await;

    assert_eq!(status, 200);
    assert_eq!(
        app.upstream.created.lock().unwrap().as_slice(),
        &[(Some(700 + PARTNER_A), PARTNER_A, 11)]
    );
}

#[tokio::test]
async fn chip_selection_of_an_unknown_line_item_is_not_found() {
    let app = TestApp::new();
    app.load().await;

    let (status, body) = app
        .post(
            "/api/v1/table/items/1/line-items/99/select",
            json!({ "action": "unallocate" }),
        )
        .await;

    assert_eq!(status, 404);
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn error_responses_carry_the_request_id() {
    let app = TestApp::new();
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/table/items/5/line-items/1/select")
        .header("content-type", "application/json")
        .header("x-request-id", "req-42")
        .body(axum::body::Body::from(r#"{"action":"unallocate"}"#))
        .unwrap();

    let response = tower::ServiceExt::oneshot(
        allocation_workbench::app_router(app.state.clone()),
        request,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), 404);
    assert_eq!(response.headers()["x-request-id"], "req-42");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["request_id"], "req-42");
}

#[tokio::test]
async fn abandoned_keep_request_still_settles_the_table() {
    let app = Arc::new(TestApp::new());
    app.load().await;
    app.upstream
        .suggesting(vec![AllocationProposal::assign(11, PARTNER_A)]);
    app.post("/api/v1/table/suggest", json!({})).await;
    let gate = app.upstream.hold_applies();

    let keep = {
        let app = app.clone();
        tokio::spawn(async move { app.post("/api/v1/table/keep", json!({})).await })
    };
    app.upstream.apply_started.notified().await;

    // neither health nor the table view waits for the save
    let (status, health) = tokio::time::timeout(Duration::from_secs(1), app.get("/api/v1/health"))
        .await
        .expect("health answers during a save");
    assert_eq!(status, 200);
    assert_eq!(health["data"]["table_phase"]["stage"], "saving");
    let (_, during) = tokio::time::timeout(Duration::from_secs(1), app.get("/api/v1/table"))
        .await
        .expect("table answers during a save");
    assert_eq!(during["data"]["table"]["phase"]["stage"], "saving");

    keep.abort();
    let _ = keep.await;
    gate.notify_one();

    let mut settled = None;
    for _ in 0..100 {
        let (_, body) = app.get("/api/v1/table").await;
        if body["data"]["table"]["phase"]["state"] == "idle" {
            settled = Some(body);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let settled = settled.expect("table settles after the abandoned keep");

    assert_eq!(settled["data"]["table"]["interaction_mode"], false);
    assert_eq!(settled["data"]["table"]["needs_refresh"], false);
    assert_eq!(app.upstream.applied_batches().len(), 1);
}

#[tokio::test]
async fn chip_edit_after_a_failed_reload_is_a_conflict() {
    let app = TestApp::new();
    app.load().await;
    app.upstream
        .suggesting(vec![AllocationProposal::assign(11, PARTNER_A)]);
    app.post("/api/v1/table/suggest", json!({})).await;
    *app.upstream.fetch_error.lock().unwrap() = Some("gateway down".into());

    let (status, body) = app.post("/api/v1/table/keep", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["result"]["outcome"], "saved");
    assert_eq!(body["data"]["table"]["needs_refresh"], true);

    let (status, body) = app
        .post(
            "/api/v1/table/items/1/line-items/11/select",
            json!({ "action": "partner", "partner_id": PARTNER_A }),
        )
        .await;

    assert_eq!(status, 409);
    assert_eq!(body["error"], "Conflict");
    assert!(app.upstream.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn toasts_from_a_failed_request_reach_the_next_table_read() {
    let app = TestApp::new();
    *app.upstream.fetch_error.lock().unwrap() = Some("gateway down".into());

    let (status, _) = app.post("/api/v1/table/load", json!({})).await;
    assert_eq!(status, 502);

    let (_, body) = app.get("/api/v1/table").await;
    assert_eq!(body["data"]["toasts"][0]["level"], "error");

    let (_, again) = app.get("/api/v1/table").await;
    assert_eq!(again["data"]["toasts"].as_array().unwrap().len(), 0);
}
