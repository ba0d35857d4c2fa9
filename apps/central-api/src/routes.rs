//! HTTP routes.
//!
//! ```text
//! GET  /health                           unauthenticated
//! POST /v1/sync/push                     PushRequest  → PushResponse
//! GET  /v1/sync/pull?deviceId&since&limit             → PullResponse
//! GET  /v1/inventory/{item_id}/stock                  → StockReport
//! POST /v1/inventory/{item_id}/compact                → CompactResponse
//! ```
//!
//! Everything under `/v1` requires a bearer token of an active device.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use tally_core::protocol::{PullRequest, PullResponse, PushRequest, PushResponse, PROTOCOL_VERSION};
use tally_core::InventorySnapshot;

use crate::auth::{extract_bearer_token, Authenticator, Principal};
use crate::error::{CentralError, CentralResult};
use crate::ledger::StockReport;
use crate::sync::CentralStore;

#[derive(Clone)]
pub struct AppState {
    pub store: CentralStore,
    authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(store: CentralStore, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            store,
            authenticator,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push))
        .route("/sync/pull", get(pull))
        .route("/inventory/{item_id}/stock", get(stock))
        .route("/inventory/{item_id}/compact", post(compact))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    protocol_version: u32,
    database: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = state.store.database().health_check().await;
    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" },
        protocol_version: PROTOCOL_VERSION,
        database,
    })
}

/// Bearer token → [`Principal`] of a registered, active device.
async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> CentralResult<Response> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CentralError::AuthFailed("missing authorization header".to_string()))?;
    let token = extract_bearer_token(header)
        .ok_or_else(|| CentralError::AuthFailed("expected a bearer token".to_string()))?;

    let principal = state.authenticator.authenticate(token).await?;
    let device = state
        .store
        .database()
        .device(&principal.device_id)
        .await?
        .ok_or_else(|| {
            CentralError::AuthFailed(format!("device {} is not registered", principal.device_id))
        })?;
    if device.account_id != principal.account_id || !device.is_active {
        return Err(CentralError::Forbidden(format!(
            "device {} may not sync for account {}",
            principal.device_id, principal.account_id
        )));
    }

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

async fn push(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<PushRequest>,
) -> CentralResult<Json<PushResponse>> {
    let response = state.store.push(&principal, &request).await?;
    Ok(Json(response))
}

async fn pull(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(request): Query<PullRequest>,
) -> CentralResult<Json<PullResponse>> {
    let response = state.store.pull(&principal, &request).await?;
    Ok(Json(response))
}

async fn stock(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(item_id): Path<String>,
) -> CentralResult<Json<StockReport>> {
    let report = state.store.stock(&principal.account_id, &item_id).await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
struct CompactResponse {
    snapshot: Option<InventorySnapshot>,
}

async fn compact(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(item_id): Path<String>,
) -> CentralResult<Json<CompactResponse>> {
    let snapshot = state
        .store
        .compact(&principal.account_id, &item_id, &principal.device_id)
        .await?;
    info!(
        endpoint = "compact",
        device_id = %principal.device_id,
        item_id = %item_id,
        compacted = snapshot.is_some(),
        "Compaction requested"
    );
    Ok(Json(CompactResponse { snapshot }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::auth::JwtManager;
    use crate::config::CentralConfig;
    use crate::db::Database;

    struct Harness {
        router: Router,
        jwt: JwtManager,
        db: Database,
    }

    async fn harness() -> Harness {
        let config = CentralConfig {
            max_batch_size: 2,
            ..CentralConfig::default()
        };
        let db = Database::in_memory().await.unwrap();
        db.create_account("acct", "Corner Cafe").await.unwrap();
        db.register_device("acct", "dev-a", "Front till").await.unwrap();

        let jwt = JwtManager::new("route-secret".to_string(), 3600);
        let state = AppState::new(
            CentralStore::new(db.clone(), &config),
            Arc::new(JwtManager::new("route-secret".to_string(), 3600)),
        );
        Harness {
            router: app_router(state),
            jwt,
            db,
        }
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let h = harness().await;
        let (status, body) = send(&h.router, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_unauthorized() {
        let h = harness().await;
        let (status, _) = send(&h.router, Method::GET, "/v1/sync/pull?deviceId=dev-a&since=0&limit=10", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &h.router,
            Method::GET,
            "/v1/sync/pull?deviceId=dev-a&since=0&limit=10",
            Some("garbage"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_retired_device_is_forbidden() {
        let h = harness().await;
        let token = h.jwt.issue_token("acct", "dev-a").unwrap();
        h.db.retire_device("dev-a").await.unwrap();

        let (status, _) = send(
            &h.router,
            Method::GET,
            "/v1/sync/pull?deviceId=dev-a&since=0&limit=10",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let h = harness().await;
        let token = h.jwt.issue_token("acct", "dev-a").unwrap();
        let item = tally_core::MenuItem::new("Latte", 12000);

        let push = json!({
            "deviceId": "dev-a",
            "lastSeenSeq": 0,
            "entries": [{
                "localId": 1,
                "entityKind": "menu_item",
                "entityId": item.id,
                "operation": "create",
                "payload": serde_json::to_value(&item).unwrap(),
                "clientTimestamp": item.updated_at,
            }]
        });
        let (status, body) = send(&h.router, Method::POST, "/v1/sync/push", Some(&token), Some(push)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["outcome"], "applied");

        let (status, body) = send(
            &h.router,
            Method::GET,
            "/v1/sync/pull?deviceId=dev-a&since=0&limit=10",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changes"].as_array().unwrap().len(), 1);
        assert_eq!(body["hasMore"], false);
    }

    #[tokio::test]
    async fn test_push_for_another_device_is_forbidden() {
        let h = harness().await;
        let token = h.jwt.issue_token("acct", "dev-a").unwrap();
        let push = json!({"deviceId": "dev-z", "lastSeenSeq": 0, "entries": []});

        let (status, _) = send(&h.router, Method::POST, "/v1/sync/push", Some(&token), Some(push)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_oversized_batch_is_bad_request() {
        let h = harness().await;
        let token = h.jwt.issue_token("acct", "dev-a").unwrap();
        let entry = |n: i64| {
            json!({
                "localId": n,
                "entityKind": "menu_item",
                "entityId": format!("m{n}"),
                "operation": "create",
                "payload": {},
                "clientTimestamp": "2026-01-01T00:00:00Z",
            })
        };
        let push = json!({
            "deviceId": "dev-a",
            "lastSeenSeq": 0,
            "entries": [entry(1), entry(2), entry(3)]
        });

        let (status, body) = send(&h.router, Method::POST, "/v1/sync/push", Some(&token), Some(push)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_stock_of_unknown_item_is_not_found() {
        let h = harness().await;
        let token = h.jwt.issue_token("acct", "dev-a").unwrap();

        let (status, _) = send(&h.router, Method::GET, "/v1/inventory/nope/stock", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&h.router, Method::POST, "/v1/inventory/nope/compact", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
