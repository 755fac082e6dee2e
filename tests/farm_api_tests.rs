use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use render_farm::config::FarmConfig;
use render_farm::farm::server::router;
use render_farm::farm::transfer::TransferStore;
use render_farm::farm::FarmRegistry;

const MAX_BUNDLE: usize = 1024 * 1024;

fn create_test_app() -> (Router, Arc<FarmRegistry>) {
    let registry = Arc::new(FarmRegistry::new(&FarmConfig::default()));
    let app = router(Arc::clone(&registry), MAX_BUNDLE)
        .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 7], 40000))));
    (app, registry)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
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

async fn register(app: &Router) -> String {
    let (status, body) = call(
        app,
        "POST",
        "/api/register",
        Some(json!({"hostname": "render-01", "port": 0, "capacity": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["node_id"].as_str().unwrap().to_string()
}

async fn add_job(app: &Router, project: &str) -> String {
    let (status, body) = call(
        app,
        "POST",
        "/api/add_job",
        Some(json!({"project": project, "settings": {"format": "PNG", "preset": null}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_status_identifies_the_service() {
    let (app, _) = create_test_app();
    let (status, body) = call(&app, "GET", "/api/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "render-farm");
    assert_eq!(body["nodes"], json!([]));
    assert_eq!(body["pending"], 0);
}

#[tokio::test]
async fn test_register_uses_peer_address() {
    let (app, _) = create_test_app();
    let node_id = register(&app).await;
    assert!(node_id.starts_with("10.0.0.7:0-"));

    let (_, body) = call(&app, "GET", "/api/status", None).await;
    assert_eq!(body["nodes"][0]["address"], "10.0.0.7");
    assert_eq!(body["nodes"][0]["hostname"], "render-01");
    assert_eq!(body["nodes"][0]["state"], "online");
}

#[tokio::test]
async fn test_job_round_trip_over_http() {
    let (app, registry) = create_test_app();
    let node_id = register(&app).await;
    let job_id = add_job(&app, "/share/shot.moho").await;

    let (status, body) = call(&app, "POST", "/api/get_job", Some(json!({"node_id": node_id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["id"], job_id.as_str());
    assert_eq!(body["job"]["status"], "reserved");
    assert_eq!(body["job"]["settings"]["format"], "PNG");

    let (status, body) = call(
        &app,
        "POST",
        "/api/heartbeat",
        Some(json!({"node_id": node_id, "jobs": [{"job_id": job_id, "progress": 0.5}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancel_jobs"], json!([]));

    let (status, body) = call(
        &app,
        "POST",
        "/api/job_complete",
        Some(json!({"node_id": node_id, "job_id": job_id, "outcome": {"status": "completed"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);

    // A repeated report is harmless.
    let (status, body) = call(
        &app,
        "POST",
        "/api/job_complete",
        Some(json!({"node_id": node_id, "job_id": job_id, "outcome": {"status": "completed"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);

    let id = job_id.parse().unwrap();
    assert_eq!(
        registry.get(&id).await.unwrap().status,
        render_farm::scheduler::JobStatus::Completed
    );
}

#[tokio::test]
async fn test_empty_pool_returns_null_job() {
    let (app, _) = create_test_app();
    let node_id = register(&app).await;
    let (status, body) = call(&app, "POST", "/api/get_job", Some(json!({"node_id": node_id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"], Value::Null);
}

#[tokio::test]
async fn test_error_status_codes() {
    let (app, _) = create_test_app();

    let (status, body) = call(
        &app,
        "POST",
        "/api/heartbeat",
        Some(json!({"node_id": "nobody", "jobs": []})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nobody"));

    let (status, _) = call(
        &app,
        "POST",
        "/api/add_job",
        Some(json!({"project": "/share/a.moho", "settings": {"quality": 42}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let job_id = add_job(&app, "/share/a.moho").await;
    let (status, _) = call(&app, "POST", &format!("/api/jobs/{}/cancel", job_id), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, "POST", &format!("/api/jobs/{}/retry", job_id), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let missing = uuid::Uuid::new_v4();
    let (status, _) = call(&app, "DELETE", &format!("/api/jobs/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_assign_and_remove_endpoints() {
    let (app, _) = create_test_app();
    let node_id = register(&app).await;
    let job_id = add_job(&app, "/share/a.moho").await;

    let (status, _) = call(
        &app,
        "POST",
        &format!("/api/jobs/{}/assign", job_id),
        Some(json!({"node_id": node_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, "POST", "/api/get_job", Some(json!({"node_id": node_id}))).await;
    assert_eq!(body["job"]["id"], job_id.as_str());

    let (status, _) = call(&app, "POST", &format!("/api/jobs/{}/cancel", job_id), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(
        &app,
        "POST",
        "/api/heartbeat",
        Some(json!({"node_id": node_id, "jobs": [{"job_id": job_id, "progress": 0.1}]})),
    )
    .await;
    assert_eq!(body["cancel_jobs"], json!([job_id]));

    // Still held by the node, so it cannot be removed yet.
    let (status, _) = call(&app, "DELETE", &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    call(
        &app,
        "POST",
        "/api/job_complete",
        Some(json!({"node_id": node_id, "job_id": job_id, "outcome": {"status": "cancelled"}})),
    )
    .await;
    let (status, _) = call(&app, "DELETE", &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, "GET", "/api/queue", None).await;
    assert_eq!(body["pending"], json!([]));
    assert_eq!(body["active"], json!([]));
}

#[tokio::test]
async fn test_bundle_upload_and_download() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        FarmRegistry::new(&FarmConfig::default()).with_transfers(TransferStore::new(dir.path())),
    );
    let app = router(Arc::clone(&registry), MAX_BUNDLE)
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    let job_id = uuid::Uuid::new_v4().to_string();
    let payload = b"PK fake zip bytes".to_vec();
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/api/transfer/{}", job_id))
        .header("content-type", "application/zip")
        .body(Body::from(payload.clone()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri(format!("/api/transfer/{}", job_id))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.to_vec(), payload);

    let (status, _) = call(&app, "GET", &format!("/api/transfer/{}", uuid::Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oversized_bundle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        FarmRegistry::new(&FarmConfig::default()).with_transfers(TransferStore::new(dir.path())),
    );
    let app = router(registry, 16).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1))));

    let request = Request::builder()
        .method("PUT")
        .uri(format!("/api/transfer/{}", uuid::Uuid::new_v4()))
        .body(Body::from(vec![0u8; 1024]))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
