//! HTTP API tests: requests go straight into the router, no socket.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{harness, Harness, PDF_BYTES};
use pdf2json::server::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "pdf2json-test-boundary";

struct App {
    router: Router,
    backend: Arc<common::ScriptedBackend>,
    _harness_dir: tempfile::TempDir,
}

async fn app() -> App {
    let Harness {
        pipeline, backend, dir, ..
    } = harness().await;
    App {
        router: create_router(AppState::new(Arc::new(pipeline))),
        backend,
        _harness_dir: dir,
    }
}

fn multipart(field: &str, filename: &str, content: &[u8]) -> Body {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n").as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/pdf\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn upload(router: &Router) -> String {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/documents")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(multipart("file", "form.pdf", PDF_BYTES))
        .unwrap();
    let (status, body) = send(router, request).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_ok() {
    let app = app().await;
    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn upload_then_read_back() {
    let app = app().await;
    let id = upload(&app.router).await;

    let (status, doc) = send(&app.router, get(&format!("/api/documents/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["filename"], "form.pdf");

    let (status, list) = send(&app.router, get("/api/documents?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, state) = send(&app.router, get(&format!("/api/documents/{id}/state"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["document_id"], id.as_str());
    assert!(state["classification"].is_null());
}

#[tokio::test]
async fn upload_without_file_part_is_bad_request() {
    let app = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/documents")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(multipart("attachment", "form.pdf", PDF_BYTES))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn non_pdf_upload_is_unprocessable() {
    let app = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/documents")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(multipart("file", "notes.pdf", b"just some text"))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "unreadable_pdf");
}

#[tokio::test]
async fn stages_run_in_order_over_http() {
    let app = app().await;
    app.backend
        .reply(r#"{"classification": "form"}"#)
        .reply(r#"{"form_fields": [{"field_name": "Name"}]}"#);
    let id = upload(&app.router).await;

    let (status, body) = send(
        &app.router,
        Request::builder()
            .method(Method::POST)
            .uri(format!("/api/documents/{id}/stages/2"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "stage_prerequisite_missing");

    // No body at all means default options.
    let (status, body) = send(
        &app.router,
        Request::builder()
            .method(Method::POST)
            .uri(format!("/api/documents/{id}/stages/1"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["stage"], "classification");
    assert_eq!(body["result"]["classification"], "form");

    let (status, body) = send(
        &app.router,
        post_json(
            &format!("/api/documents/{id}/stages/2"),
            json!({"mode": "spatial", "pages": "all"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["fields"][0]["name"], "Name");
    assert_eq!(body["result"]["mode"], "spatial");
}

#[tokio::test]
async fn invalid_stage_and_unknown_document() {
    let app = app().await;
    let id = upload(&app.router).await;

    let (status, body) = send(&app.router, post_json(&format!("/api/documents/{id}/stages/4"), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_stage");

    let (status, body) = send(
        &app.router,
        get("/api/documents/5f0c8a52-0000-4000-8000-000000000000/state"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "document_not_found");
}

#[tokio::test]
async fn malformed_stage_options_are_rejected() {
    let app = app().await;
    let id = upload(&app.router).await;

    let (status, body) = send(
        &app.router,
        post_json(&format!("/api/documents/{id}/stages/1"), json!({"mode": "spatail"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/documents/{id}/stages/1"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"mode\": "))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
    assert_eq!(app.backend.call_count(), 0);
}

#[tokio::test]
async fn refine_validate_and_feedback() {
    let app = app().await;
    app.backend
        .reply(r#"{"classification": "table"}"#)
        .reply(r#"{"classification": "form"}"#);
    let id = upload(&app.router).await;
    send(&app.router, post_json(&format!("/api/documents/{id}/stages/1"), json!({}))).await;

    let (status, body) = send(
        &app.router,
        post_json(
            &format!("/api/documents/{id}/stages/1/refine"),
            json!({"feedback": "It is a form"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["classification"], "form");

    let (status, history) = send(&app.router, get(&format!("/api/documents/{id}/stages/1/feedback"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history[0]["iteration"], 1);
    assert_eq!(history[0]["feedback"], "It is a form");

    let (status, body) = send(
        &app.router,
        post_json(
            &format!("/api/documents/{id}/stages/1/validate"),
            json!({"classification": "mixed"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["classification"], "mixed");

    let (_, state) = send(&app.router, get(&format!("/api/documents/{id}/state"))).await;
    assert!(state["validated_at"]["classification"].is_string());

    let (status, state) = send(
        &app.router,
        post_json(&format!("/api/documents/{id}/stages/1/reset-validation"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(state["validated_at"].as_object().map_or(true, |m| m.is_empty()));
}

#[tokio::test]
async fn field_region_edit_maps_errors() {
    let app = app().await;
    let id = upload(&app.router).await;
    let request = Request::builder()
        .method(Method::PUT)
        .uri(format!("/api/documents/{id}/fields/1/region"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"x0": 1.0, "y0": 1.0, "x1": 5.0, "y1": 5.0}).to_string()))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "no_stage_result");
}

#[tokio::test]
async fn layout_and_preview() {
    let app = app().await;
    let id = upload(&app.router).await;

    let (status, layout) = send(&app.router, get(&format!("/api/documents/{id}/field-boundaries"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(layout["page_count"], 1);
    assert!(!layout["boundaries"].as_array().unwrap().is_empty());

    let (status, preview) = send(
        &app.router,
        get(&format!("/api/documents/{id}/preview?mode=spatial&page=1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["mode"], "spatial");
    assert!(preview["text"].as_str().unwrap().contains("[EMPTY]"));

    let (status, body) = send(&app.router, get(&format!("/api/documents/{id}/preview?page=0"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn usage_report_includes_suggestions() {
    let app = app().await;
    app.backend.reply(r#"{"classification": "form"}"#);
    let id = upload(&app.router).await;
    send(&app.router, post_json(&format!("/api/documents/{id}/stages/1"), json!({}))).await;

    let (status, report) = send(&app.router, get("/api/usage?days=30")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["period_days"], 30);
    assert_eq!(report["total_requests"], 1);
    assert!(report["task_breakdown"]["classification"].is_object());
    assert!(report["suggestions"].is_array());

    let (status, report) = send(&app.router, get("/api/usage?days=4294967295")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["total_requests"], 1);

    let (status, records) = send(&app.router, get("/api/usage/records")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records[0]["model"], "gpt-3.5-turbo");
}

#[tokio::test]
async fn delete_document_returns_no_content() {
    let app = app().await;
    let id = upload(&app.router).await;
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/documents/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app.router, get(&format!("/api/documents/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
