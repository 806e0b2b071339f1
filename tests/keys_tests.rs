mod common;

use axum::http::{Method, StatusCode};
use base64::Engine;
use serial_test::serial;
use tower::ServiceExt;

use common::{authed_json_request, body_json, create_test_app, register_user, test_pool, test_state, unique_email, unique_username};

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[tokio::test]
#[serial]
async fn uploaded_keys_are_fetchable_as_a_bundle() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let (bob_id, bob_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (_, ann_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    let upload = authed_json_request(
        Method::POST,
        "/v1/keys",
        &bob_token,
        serde_json::json!({
            "identity_key": b64(b"identity"),
            "signed_pre_key": b64(b"signed"),
            "signed_pre_key_signature": b64(b"signature"),
            "one_time_pre_keys": [b64(b"otpk-0"), b64(b"otpk-1")],
        }),
    );
    let response = app.clone().oneshot(upload).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let fetch = axum::http::Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/keys/{bob_id}"))
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {ann_token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(fetch).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bundle = body_json(response).await;
    assert!(bundle["one_time_pre_key"].is_string());
}

#[tokio::test]
#[serial]
async fn one_time_pre_keys_are_consumed_exactly_once() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let (bob_id, bob_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (_, ann_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    let upload = authed_json_request(
        Method::POST,
        "/v1/keys",
        &bob_token,
        serde_json::json!({
            "identity_key": b64(b"identity"),
            "signed_pre_key": b64(b"signed"),
            "signed_pre_key_signature": b64(b"signature"),
            "one_time_pre_keys": [b64(b"only-one")],
        }),
    );
    app.clone().oneshot(upload).await.unwrap();

    let fetch_once = || {
        let app = app.clone();
        let ann_token = ann_token.clone();
        async move {
            let request = axum::http::Request::builder()
                .method(Method::GET)
                .uri(format!("/v1/keys/{bob_id}"))
                .header(axum::http::header::AUTHORIZATION, format!("Bearer {ann_token}"))
                .body(axum::body::Body::empty())
                .unwrap();
            body_json(app.oneshot(request).await.unwrap()).await
        }
    };

    let first = fetch_once().await;
    assert!(first["one_time_pre_key"].is_string());

    let second = fetch_once().await;
    assert!(second["one_time_pre_key"].is_null());
}
