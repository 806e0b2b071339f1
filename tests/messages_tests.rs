mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use base64::Engine;
use serial_test::serial;
use tower::ServiceExt;
use uuid::Uuid;

use common::{authed_json_request, body_json, create_test_app, register_user, test_pool, test_state, unique_email, unique_username};

/// Conversation creation is out of scope for this surface (handled by an
/// external admin collaborator); tests seed the row directly, matching how
/// a pre-provisioned conversation would already exist in production.
async fn seed_direct_conversation(pool: &sqlx::PgPool, a: Uuid, b: Uuid) -> Uuid {
    let conversation_id = Uuid::new_v4();
    sqlx::query("INSERT INTO conversations (id, type, e2ee_enabled, ai_opt_in, created_by) VALUES ($1, 'direct', true, false, $2)")
        .bind(conversation_id)
        .bind(a)
        .execute(pool)
        .await
        .unwrap();
    for user_id in [a, b] {
        sqlx::query("INSERT INTO conversation_participants (conversation_id, user_id, role) VALUES ($1, $2, 'member')")
            .bind(conversation_id)
            .bind(user_id)
            .execute(pool)
            .await
            .unwrap();
    }
    conversation_id
}

#[tokio::test]
#[serial]
async fn sent_message_is_readable_via_list_messages() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool.clone()).await);

    let (ann_id, ann_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (bob_id, bob_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let conversation_id = seed_direct_conversation(&pool, ann_id, bob_id).await;

    let content = base64::engine::general_purpose::STANDARD.encode(b"hi");
    let send = authed_json_request(
        Method::POST,
        "/v1/messages",
        &ann_token,
        serde_json::json!({
            "conversation_id": conversation_id,
            "content": content,
            "encrypted": false,
            "message_type": "text",
        }),
    );
    let response = app.clone().oneshot(send).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let sent = body_json(response).await;
    let message_id = sent["message_id"].as_str().unwrap().to_string();
    assert_eq!(sent["sender_id"].as_str().unwrap(), ann_id.to_string());

    let list = Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/messages?conversation_id={conversation_id}&limit=10"))
        .header(header::AUTHORIZATION, format!("Bearer {bob_token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(list).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_json(response).await;
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["message_id"].as_str().unwrap(), message_id);
}

#[tokio::test]
#[serial]
async fn non_participant_cannot_send_or_list_messages() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool.clone()).await);

    let (ann_id, _) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (bob_id, _) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (_, carol_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let conversation_id = seed_direct_conversation(&pool, ann_id, bob_id).await;

    let send = authed_json_request(
        Method::POST,
        "/v1/messages",
        &carol_token,
        serde_json::json!({
            "conversation_id": conversation_id,
            "content": base64::engine::general_purpose::STANDARD.encode(b"hi"),
            "encrypted": false,
            "message_type": "text",
        }),
    );
    let response = app.clone().oneshot(send).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
#[serial]
async fn message_pagination_returns_a_cursor_when_more_remain() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool.clone()).await);

    let (ann_id, ann_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (bob_id, _) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let conversation_id = seed_direct_conversation(&pool, ann_id, bob_id).await;

    for i in 0..5 {
        let content = base64::engine::general_purpose::STANDARD.encode(format!("msg-{i}"));
        let send = authed_json_request(
            Method::POST,
            "/v1/messages",
            &ann_token,
            serde_json::json!({
                "conversation_id": conversation_id,
                "content": content,
                "encrypted": false,
                "message_type": "text",
            }),
        );
        let response = app.clone().oneshot(send).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let list = Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/messages?conversation_id={conversation_id}&limit=2"))
        .header(header::AUTHORIZATION, format!("Bearer {ann_token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(list).await.unwrap();
    let page = body_json(response).await;
    assert_eq!(page["messages"].as_array().unwrap().len(), 2);
    assert!(page["next_cursor"].is_string());
}

#[tokio::test]
#[serial]
async fn presence_update_accepts_a_known_status() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let (_, token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    let request = authed_json_request(Method::POST, "/v1/presence", &token, serde_json::json!({ "status": "away" }));
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "away");
}

#[tokio::test]
#[serial]
async fn presence_update_rejects_an_unknown_status() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let (_, token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    let request = authed_json_request(Method::POST, "/v1/presence", &token, serde_json::json!({ "status": "busy" }));
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
