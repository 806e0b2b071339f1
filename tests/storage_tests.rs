mod common;

use axum::http::{Method, StatusCode};
use serial_test::serial;
use tower::ServiceExt;

use common::{authed_json_request, body_json, create_test_app, register_user, test_pool, test_state, unique_email, unique_username};

fn set_fake_s3_env() {
    std::env::set_var("MINIO_ENDPOINT", "http://localhost:9000");
    std::env::set_var("MINIO_ACCESS_KEY", "test-access-key");
    std::env::set_var("MINIO_SECRET_KEY", "test-secret-key");
}

#[tokio::test]
#[serial]
async fn upload_url_creation_records_a_pending_file() {
    set_fake_s3_env();
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);
    let (_, token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    let request = authed_json_request(
        Method::POST,
        "/v1/storage/upload-url",
        &token,
        serde_json::json!({ "content_type": "image/png", "size_bytes": 2048 }),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["file"]["upload_complete"], false);
    assert!(body["upload_url"].as_str().unwrap().contains("http"));
}

#[tokio::test]
#[serial]
async fn upload_exceeding_quota_is_rejected() {
    set_fake_s3_env();
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);
    let (_, token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    // Standard quota is 20 GiB; request one byte over it.
    let oversized = 20i64 * 1024 * 1024 * 1024 + 1;
    let request = authed_json_request(
        Method::POST,
        "/v1/storage/upload-url",
        &token,
        serde_json::json!({ "content_type": "video/mp4", "size_bytes": oversized }),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_ne!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
#[serial]
async fn quota_reflects_completed_uploads_only() {
    set_fake_s3_env();
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);
    let (_, token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    let create = authed_json_request(
        Method::POST,
        "/v1/storage/upload-url",
        &token,
        serde_json::json!({ "content_type": "image/png", "size_bytes": 1024 }),
    );
    let response = app.clone().oneshot(create).await.unwrap();
    let created = body_json(response).await;
    let file_id = created["file"]["id"].as_str().unwrap().to_string();

    let quota_before = axum::http::Request::builder()
        .method(Method::GET)
        .uri("/v1/storage/quota")
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(quota_before).await.unwrap();
    let before = body_json(response).await;
    assert_eq!(before["used_bytes"], 0);

    let complete = axum::http::Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/storage/files/{file_id}/complete"))
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(complete).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let quota_after = axum::http::Request::builder()
        .method(Method::GET)
        .uri("/v1/storage/quota")
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(quota_after).await.unwrap();
    let after = body_json(response).await;
    assert_eq!(after["used_bytes"], 1024);
}
