pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::resilience::DegradedFlag;
use crate::state::AppState;
use rate_limit::RateLimiter;

const REQUEST_ID_HEADER: &str = "x-request-id";
const DEGRADED_HEADER: &str = "x-degraded";

/// Wraps `router` with the full chain from §4.7:
/// Recovery → RequestID → Logger → CORS → Timeout(30s) → RateLimit →
/// (Auth/Revocation are enforced per-handler by the `AuthUser` extractor,
/// which also consults the revocation list, per DESIGN.md).
pub fn apply_middleware(router: Router<AppState>, config: &Config, cache: crate::cache::CacheClient) -> Router<AppState> {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);
    let degraded_flag = cache.degraded_flag();
    let rate_limiter = Arc::new(RateLimiter::new(cache, config.rate_limits.clone()));

    let cors = if config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    router
        .layer(middleware::from_fn_with_state(rate_limiter, rate_limit::rate_limit_middleware))
        .layer(middleware::from_fn_with_state(degraded_flag, set_degraded_header))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(header_name.clone()))
        .layer(SetRequestIdLayer::new(header_name, MakeRequestUuid))
        .layer(CatchPanicLayer::custom(handle_panic))
}

/// Surfaces the shared-state store's degraded status on every response, per
/// §7: clients (and operators watching response headers) can tell a request
/// was served under fail-open/in-memory-fallback policy without scraping
/// `/metrics`.
async fn set_degraded_header(
    State(flag): State<DegradedFlag>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    if flag.is_degraded() {
        response
            .headers_mut()
            .insert(HeaderName::from_static(DEGRADED_HEADER), HeaderValue::from_static("true"));
    }
    response
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");
    crate::error::AppError::Internal.into_response()
}

#[cfg(test)]
mod tests {
    #[test]
    fn request_id_header_name_is_lowercase() {
        assert_eq!(super::REQUEST_ID_HEADER, "x-request-id");
    }
}
