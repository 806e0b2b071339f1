mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use serial_test::serial;
use tower::ServiceExt;

use common::{
    body_json, create_test_app, register_user, seed_action_token, test_pool, test_state, unique_email,
    unique_username,
};
use secureconnect::auth::session_store;

#[tokio::test]
#[serial]
async fn register_then_login_round_trips_credentials() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let email = unique_email();
    let username = unique_username();
    let (user_id, _access_token) = register_user(&app, &email, &username, "Abcdef12").await;

    let login = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "email": email, "password": "Abcdef12" }).to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(login).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["user"]["id"].as_str().unwrap(), user_id.to_string());
    assert!(!body["access_token"].as_str().unwrap().is_empty());
    assert!(!body["refresh_token"].as_str().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn login_with_wrong_password_is_rejected() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let email = unique_email();
    register_user(&app, &email, &unique_username(), "Abcdef12").await;

    let login = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "email": email, "password": "wrong-password" }).to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(login).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_CREDENTIALS");
}

#[tokio::test]
#[serial]
async fn duplicate_email_registration_returns_conflict() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let email = unique_email();
    register_user(&app, &email, &unique_username(), "Abcdef12").await;

    let second = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "email": email, "username": unique_username(), "password": "Abcdef12" }).to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
#[serial]
async fn refresh_token_issues_a_new_access_token() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let login_request = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "email": unique_email(),
                "username": unique_username(),
                "password": "Abcdef12",
            })
            .to_string(),
        ))
        .unwrap();
    let register_response = app.clone().oneshot(login_request).await.unwrap();
    let register_body = body_json(register_response).await;
    let refresh_token = register_body["refresh_token"].as_str().unwrap().to_string();

    let refresh = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/refresh")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "refresh_token": refresh_token }).to_string()))
        .unwrap();

    let response = app.clone().oneshot(refresh).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(!body["access_token"].as_str().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn profile_requires_a_bearer_token() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/auth/profile")
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Requesting a reset must look identical whether or not the email is
/// registered — distinguishing the two would let a caller enumerate accounts.
#[tokio::test]
#[serial]
async fn password_reset_request_returns_200_regardless_of_email_existing() {
    let pool = test_pool().await;
    let state = test_state(pool).await;
    let app = create_test_app(state);

    let email = unique_email();
    register_user(&app, &email, &unique_username(), "Abcdef12").await;

    let known = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/password-reset")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "email": email }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(known).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let unknown = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/password-reset")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "email": unique_email() }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(unknown).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
#[serial]
async fn password_reset_confirm_rotates_the_password_and_revokes_sessions() {
    let pool = test_pool().await;
    let state = test_state(pool).await;
    let app = create_test_app(state.clone());

    let email = unique_email();
    let (_user_id, _access_token) = register_user(&app, &email, &unique_username(), "Abcdef12").await;

    let token = uuid::Uuid::new_v4().to_string();
    let (user_id,): (uuid::Uuid,) = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(&email)
        .fetch_one(&state.pool)
        .await
        .unwrap();
    seed_action_token(&state, &token, user_id, "password_reset").await;

    let confirm = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/password-reset/confirm")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "token": token, "new_password": "NewPassw0rd!" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(confirm).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let old_login = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "email": email, "password": "Abcdef12" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(old_login).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let new_login = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "email": email, "password": "NewPassw0rd!" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(new_login).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
#[serial]
async fn password_reset_confirm_rejects_an_unknown_token() {
    let pool = test_pool().await;
    let app = create_test_app(test_state(pool).await);

    let confirm = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/password-reset/confirm")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "token": uuid::Uuid::new_v4().to_string(), "new_password": "NewPassw0rd!" })
                .to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(confirm).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[serial]
async fn verify_email_marks_the_account_verified() {
    let pool = test_pool().await;
    let state = test_state(pool).await;
    let app = create_test_app(state.clone());

    let email = unique_email();
    register_user(&app, &email, &unique_username(), "Abcdef12").await;

    let (user_id, email_verified): (uuid::Uuid, bool) =
        sqlx::query_as("SELECT id, email_verified FROM users WHERE email = $1")
            .bind(&email)
            .fetch_one(&state.pool)
            .await
            .unwrap();
    assert!(!email_verified, "freshly registered accounts start unverified");

    let token = uuid::Uuid::new_v4().to_string();
    seed_action_token(&state, &token, user_id, "email_verification").await;

    let verify = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/verify-email")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "token": token }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(verify).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (email_verified,): (bool,) = sqlx::query_as("SELECT email_verified FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(&state.pool)
        .await
        .unwrap();
    assert!(email_verified);
}

/// Five failed logins lock the account per §4.3's threshold; the lockout
/// reads as the same `INVALID_CREDENTIALS` response as a wrong password so a
/// caller can't distinguish "locked" from "wrong password" (the anti-
/// enumeration property `AppError::AccountLocked` shares with
/// `AppError::InvalidCredentials`). Clearing the failed-login counters
/// stands in for the 15-minute window elapsing.
#[tokio::test]
#[serial]
async fn repeated_failed_logins_lock_the_account_until_the_window_clears() {
    let pool = test_pool().await;
    let state = test_state(pool).await;
    let app = create_test_app(state.clone());

    let email = unique_email();
    register_user(&app, &email, &unique_username(), "Abcdef12").await;

    for _ in 0..5 {
        let login = Request::builder()
            .method(Method::POST)
            .uri("/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({ "email": email, "password": "wrong-password" }).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(login).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let locked_login = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "email": email, "password": "Abcdef12" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(locked_login).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_CREDENTIALS");

    session_store::clear_failed_logins(&state.cache, &email).await.unwrap();

    let recovered_login = Request::builder()
        .method(Method::POST)
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "email": email, "password": "Abcdef12" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(recovered_login).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
