use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use secureconnect::config::Config;
use secureconnect::state::AppState;
use secureconnect::{gateway, handlers, jobs, observability};

/// Restricts `/metrics` to loopback callers — the scrape target lives on the
/// same host or a sidecar, never across the public network.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("failed to load configuration");
    observability::init_tracing(config.env);
    info!("secureconnect starting");

    let (prometheus_layer, metric_handle) = observability::install_metrics_recorder();

    let state = AppState::build(config.clone(), metric_handle)
        .await
        .expect("failed to initialize application state");
    info!("application state initialized");

    sqlx::migrate!("./migrations")
        .run(&state.pool)
        .await
        .expect("failed to run database migrations");
    info!("database migrations applied");

    let jobs_pool = state.pool.clone();
    tokio::spawn(async move {
        jobs::run(jobs_pool, std::time::Duration::from_secs(60)).await;
    });

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics).route_layer(middleware::from_fn(require_loopback)),
        )
        .route("/v1/auth/register", post(handlers::auth::register))
        .route("/v1/auth/login", post(handlers::auth::login))
        .route("/v1/auth/refresh", post(handlers::auth::refresh))
        .route("/v1/auth/logout", post(handlers::auth::logout))
        .route("/v1/auth/profile", get(handlers::auth::profile))
        .route(
            "/v1/auth/password-reset",
            post(handlers::auth::request_password_reset),
        )
        .route(
            "/v1/auth/password-reset/confirm",
            post(handlers::auth::confirm_password_reset),
        )
        .route("/v1/auth/verify-email", post(handlers::auth::verify_email))
        .route("/v1/users/me", get(handlers::users::get_me))
        .route("/v1/users/me", patch(handlers::users::update_me))
        .route(
            "/v1/users/me/password",
            post(handlers::users::change_password),
        )
        .route("/v1/users/me/email", post(handlers::users::change_email))
        .route("/v1/users/me", axum::routing::delete(handlers::users::delete_me))
        .route("/v1/users/blocked", get(handlers::users::list_blocked))
        .route(
            "/v1/users/:id/block",
            post(handlers::users::block_user),
        )
        .route(
            "/v1/users/:id/block",
            axum::routing::delete(handlers::users::unblock_user),
        )
        .route(
            "/v1/users/:id/friend-request",
            post(handlers::users::send_friend_request),
        )
        .route(
            "/v1/users/:id/friend-request/accept",
            post(handlers::users::accept_friend_request),
        )
        .route("/v1/users/friends", get(handlers::users::list_friends))
        .route("/v1/keys", post(handlers::keys::upload_keys))
        .route("/v1/keys", patch(handlers::keys::rotate_keys))
        .route("/v1/keys/:user_id", get(handlers::keys::get_key_bundle))
        .route("/v1/messages", post(handlers::messages::send_message))
        .route("/v1/messages", get(handlers::messages::list_messages))
        .route("/v1/ws/chat", get(handlers::messages::chat_ws))
        .route("/v1/presence", post(handlers::messages::update_presence))
        .route("/v1/calls/initiate", post(handlers::calls::initiate_call))
        .route("/v1/calls/ice-servers", get(handlers::calls::ice_servers))
        .route("/v1/calls/ws/signaling", get(handlers::calls::signaling_ws))
        .route("/v1/calls/:id/join", post(handlers::calls::join_call))
        .route("/v1/calls/:id/leave", post(handlers::calls::leave_call))
        .route("/v1/calls/:id/end", post(handlers::calls::end_call))
        .route("/v1/calls/:id", get(handlers::calls::get_call))
        .route(
            "/v1/storage/upload-url",
            post(handlers::storage::create_upload_url),
        )
        .route(
            "/v1/storage/files/:id/complete",
            post(handlers::storage::mark_upload_complete),
        )
        .route(
            "/v1/storage/files/:id/download-url",
            get(handlers::storage::get_download_url),
        )
        .route(
            "/v1/storage/files/:id",
            axum::routing::delete(handlers::storage::delete_file),
        )
        .route("/v1/storage/quota", get(handlers::storage::get_quota))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(prometheus_layer);

    let app = gateway::apply_middleware(app, &config, state.cache.clone()).with_state(state.clone());

    let addr = config.server_addr();
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind listener");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("server error");
}
