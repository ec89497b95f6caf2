//! Admin API: health, admission counters and per-identity window control.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::middleware::Admission;
use crate::ratelimit::{AdmissionStats, IdentityKey, StatsSnapshot, Tier};

#[derive(Clone)]
struct AdminState {
    admission: Admission,
    stats: Arc<AdmissionStats>,
}

/// Current window of one identity.
#[derive(Debug, Serialize)]
pub struct LimitStatus {
    /// Namespaced counter key
    pub key: String,
    /// Requests counted in the current window, `None` if no window is open
    pub count: Option<u64>,
    /// Requests admitted per window for this tier
    pub limit: u64,
    /// Window length for this tier in seconds
    pub window_secs: u64,
}

/// Build the admin router.
///
/// This API can clear any identity's window and should only be bound to a
/// trusted interface.
pub fn admin_router(admission: Admission, stats: Arc<AdmissionStats>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats_snapshot))
        .route(
            "/limits/{tier}/{identity}",
            get(limit_status).delete(reset_limit),
        )
        .with_state(AdminState { admission, stats })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn stats_snapshot(State(state): State<AdminState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

fn identity(tier: &str, identity: &str) -> Result<IdentityKey, Response> {
    let tier: Tier = tier
        .parse()
        .map_err(|e: crate::ratelimit::UnknownTier| {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        })?;

    Ok(match tier {
        Tier::Ip => IdentityKey::client_addr(identity),
        Tier::Token => IdentityKey::token(identity),
    })
}

fn store_failure() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

async fn limit_status(
    State(state): State<AdminState>,
    Path((tier, id)): Path<(String, String)>,
) -> Response {
    let key = match identity(&tier, &id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let limiter = state.admission.limiter(key.tier());

    match limiter.count(&key).await {
        Ok(count) => Json(LimitStatus {
            key: key.as_str().to_string(),
            count,
            limit: limiter.policy().requests_per_window(),
            window_secs: limiter.policy().window().as_secs(),
        })
        .into_response(),
        Err(_) => store_failure(),
    }
}

async fn reset_limit(
    State(state): State<AdminState>,
    Path((tier, id)): Path<(String, String)>,
) -> Response {
    let key = match identity(&tier, &id) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match state.admission.limiter(key.tier()).reset(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => store_failure(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Policy, RateLimiter};
    use crate::store::{CounterStore, MemoryCounterStore};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    fn setup() -> (Router, Admission, Arc<MemoryCounterStore>, Arc<AdmissionStats>) {
        let store = Arc::new(MemoryCounterStore::new());
        let stats = Arc::new(AdmissionStats::new());
        let ip = Arc::new(
            RateLimiter::new(
                store.clone(),
                Policy::new(2, Duration::from_secs(60)).unwrap(),
            )
            .with_observer(stats.clone()),
        );
        let token = Arc::new(
            RateLimiter::new(
                store.clone(),
                Policy::new(10, Duration::from_secs(300)).unwrap(),
            )
            .with_observer(stats.clone()),
        );
        let admission = Admission::new(ip, token);
        let router = admin_router(admission.clone(), stats.clone());
        (router, admission, store, stats)
    }

    async fn call(router: &Router, method: Method, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _, _, _) = setup();
        let (status, body) = call(&router, Method::GET, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_limit_status_and_reset() {
        let (router, admission, _, _) = setup();
        let key = IdentityKey::token("tok-A");
        admission.limiter(Tier::Token).allow(&key).await.unwrap();
        admission.limiter(Tier::Token).allow(&key).await.unwrap();

        let (status, body) = call(&router, Method::GET, "/limits/token/tok-A").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["key"], "token:tok-A");
        assert_eq!(json["count"], 2);
        assert_eq!(json["limit"], 10);
        assert_eq!(json["window_secs"], 300);

        let (status, _) = call(&router, Method::DELETE, "/limits/token/tok-A").await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&router, Method::GET, "/limits/token/tok-A").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(json["count"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_tier_is_bad_request() {
        let (router, _, _, _) = setup();
        let (status, _) = call(&router, Method::GET, "/limits/region/eu").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_reflect_decisions() {
        let (router, admission, _, _) = setup();
        let key = IdentityKey::client_addr("10.0.0.1");
        for _ in 0..3 {
            admission.limiter(Tier::Ip).allow(&key).await.unwrap();
        }

        let (status, body) = call(&router, Method::GET, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["ip"]["admitted"], 2);
        assert_eq!(json["ip"]["rejected"], 1);
        assert_eq!(json["token"]["admitted"], 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_500() {
        let (router, _, store, stats) = setup();
        store.close().await.unwrap();

        let (status, _) = call(&router, Method::DELETE, "/limits/ip/10.0.0.1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(stats.snapshot().ip.store_failures, 1);

        let (status, _) = call(&router, Method::GET, "/limits/ip/10.0.0.1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
