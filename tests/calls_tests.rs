mod common;

use axum::http::{Method, StatusCode};
use serial_test::serial;
use tower::ServiceExt;
use uuid::Uuid;

use common::{authed_json_request, body_json, create_test_app, register_user, test_pool, test_state, unique_email, unique_username};

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
async fn call_lifecycle_moves_from_ringing_to_ended() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool.clone()).await);

    let (ann_id, ann_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (bob_id, bob_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let conversation_id = seed_direct_conversation(&pool, ann_id, bob_id).await;

    let initiate = authed_json_request(
        Method::POST,
        "/v1/calls/initiate",
        &ann_token,
        serde_json::json!({ "conversation_id": conversation_id }),
    );
    let response = app.clone().oneshot(initiate).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let call = body_json(response).await;
    assert_eq!(call["status"], "ringing");
    let call_id = call["id"].as_str().unwrap().to_string();

    // Only the signaling hub transitions ringing -> active on a WS join; the
    // REST join endpoint only gates participation, so status stays ringing
    // until a signaling-socket join happens. End is still allowed by the
    // initiator directly from ringing.
    let join = axum::http::Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/calls/{call_id}/join"))
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {bob_token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(join).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let end = axum::http::Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/calls/{call_id}/end"))
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {ann_token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(end).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let get = axum::http::Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/calls/{call_id}"))
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {ann_token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(get).await.unwrap();
    let call = body_json(response).await;
    assert_eq!(call["status"], "ended");
}

#[tokio::test]
#[serial]
async fn only_the_initiator_can_end_a_call() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool.clone()).await);

    let (ann_id, ann_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let (bob_id, bob_token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;
    let conversation_id = seed_direct_conversation(&pool, ann_id, bob_id).await;

    let initiate = authed_json_request(
        Method::POST,
        "/v1/calls/initiate",
        &ann_token,
        serde_json::json!({ "conversation_id": conversation_id }),
    );
    let response = app.clone().oneshot(initiate).await.unwrap();
    let call = body_json(response).await;
    let call_id = call["id"].as_str().unwrap().to_string();

    let end = axum::http::Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/calls/{call_id}/end"))
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {bob_token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(end).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
#[serial]
async fn ice_servers_returns_turn_credentials_when_configured() {
    std::env::set_var("WEBRTC_STUN_SERVERS", "stun:stun.example.com:3478");
    std::env::set_var("WEBRTC_TURN_SERVERS", "turn:turn.example.com:3478");
    std::env::set_var("TURN_PASSWORD", "shared-turn-secret");

    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);
    let (_, token) = register_user(&app, &unique_email(), &unique_username(), "Abcdef12").await;

    let request = axum::http::Request::builder()
        .method(Method::GET)
        .uri("/v1/calls/ice-servers")
        .header(axum::http::header::AUTHORIZATION, format!("Bearer {token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let servers = body["ice_servers"].as_array().unwrap();
    assert_eq!(servers.len(), 2);
    let turn = servers.iter().find(|s| s["urls"][0].as_str().unwrap().starts_with("turn:")).unwrap();
    assert!(turn["credential"].is_string());

    std::env::remove_var("WEBRTC_STUN_SERVERS");
    std::env::remove_var("WEBRTC_TURN_SERVERS");
    std::env::remove_var("TURN_PASSWORD");
}
