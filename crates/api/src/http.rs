//! REST adapter.
//!
//! - `PATCH  /v1/objects` apply (headers `X-Field-Manager`, optional `X-Force: true`)
//! - `GET    /v1/objects?group=&version=&kind=&account=&name=&namePrefix=` list
//! - `GET    /v1/objects/{group}/{version}/{kind}/{account}/{name}` get one
//! - `DELETE /v1/objects/{group}/{version}/{kind}/{account}/{name}` delete
//! - `GET    /v1/kinds` registered kinds
//! - `GET    /healthz`
//!
//! Every route except `/healthz` requires an `Authorization` credential accepted
//! by the configured [`SessionVerifier`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strata_core::{key_from_payload, ApplyRequest, Context, FieldConflict, ListFilter, ObjectKey, StrataError};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::{Session, SessionVerifier};
use crate::{ApplyStatus, DeleteStatus, StrataApi};

pub const HEADER_FIELD_MANAGER: &str = "X-Field-Manager";
pub const HEADER_FORCE_APPLY: &str = "X-Force";

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Upper bound for one request against the API.
    pub request_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30) }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let secs = std::env::var("STRATA_REQUEST_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30);
        Self { request_timeout: Duration::from_secs(secs) }
    }
}

#[derive(Clone)]
struct AppState {
    api: Arc<dyn StrataApi>,
    verifier: Arc<dyn SessionVerifier>,
    config: HttpConfig,
}

pub fn router(api: Arc<dyn StrataApi>, verifier: Arc<dyn SessionVerifier>, config: HttpConfig) -> Router {
    let state = AppState { api, verifier, config };
    Router::new()
        .route("/v1/objects", get(list_objects).patch(apply_object))
        .route("/v1/objects/{group}/{version}/{kind}/{account}/{name}", get(get_object).delete(delete_object))
        .route("/v1/kinds", get(list_kinds))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body shared by server and client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<FieldConflict>,
}

impl ErrorBody {
    pub fn from_error(err: &StrataError) -> Self {
        let conflicts = match err {
            StrataError::Conflict(c) => c.clone(),
            _ => Vec::new(),
        };
        Self { status: err.status(), error: err.code().to_string(), message: err.to_string(), conflicts }
    }

    /// Rebuild the typed error on the client side.
    pub fn into_error(self) -> StrataError {
        let detail = self.message.split_once(": ").map(|(_, d)| d.to_string()).unwrap_or(self.message);
        match self.error.as_str() {
            "not_found" => StrataError::NotFound(detail),
            "conflict" if !self.conflicts.is_empty() => StrataError::Conflict(self.conflicts),
            "validation" => StrataError::Validation(detail),
            "transport" => StrataError::Transport(detail),
            "internal" => StrataError::Internal(detail),
            _ => StrataError::from_status(self.status, detail),
        }
    }
}

enum ApiError {
    Strata(StrataError),
    Unauthorized,
}

impl From<StrataError> for ApiError {
    fn from(e: StrataError) -> Self {
        Self::Strata(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self {
            Self::Strata(e) => ErrorBody::from_error(&e),
            Self::Unauthorized => ErrorBody {
                status: 401,
                error: "unauthorized".into(),
                message: "unauthorized: missing or invalid credential".into(),
                conflicts: Vec::new(),
            },
        };
        let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let credential = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    state.verifier.verify(credential).await.ok_or(ApiError::Unauthorized)
}

fn finish(command: &'static str, t0: Instant, res: ApiResult<Response>) -> Response {
    let resp = res.unwrap_or_else(IntoResponse::into_response);
    let status = resp.status();
    counter!("api_requests_total", 1u64, "transport" => "http", "command" => command, "status" => status.as_u16().to_string());
    debug!(command, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "http: request served");
    resp
}

fn request_ctx(state: &AppState) -> Context {
    Context::with_timeout(state.config.request_timeout)
}

async fn apply_object(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let t0 = Instant::now();
    finish("apply", t0, apply_inner(&state, &headers, &body).await)
}

async fn apply_inner(state: &AppState, headers: &HeaderMap, body: &[u8]) -> ApiResult<Response> {
    let session = authorize(state, headers).await?;
    let manager = headers
        .get(HEADER_FIELD_MANAGER)
        .and_then(|v| v.to_str().ok())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| StrataError::Validation(format!("{HEADER_FIELD_MANAGER} header is required")))?
        .to_string();
    let force = headers
        .get(HEADER_FORCE_APPLY)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let payload: JsonValue =
        serde_json::from_slice(body).map_err(|e| StrataError::Validation(format!("decoding request body: {e}")))?;
    let key = key_from_payload(&payload)?;
    debug!(key = %key, manager = %manager, caller = %session.subject, force, "http: apply");
    let outcome = state
        .api
        .apply(&request_ctx(state), ApplyRequest { key: key.clone(), manager, payload, force })
        .await?;
    let status = StatusCode::from_u16(outcome.status()).unwrap_or(StatusCode::OK);
    if status == StatusCode::NOT_MODIFIED {
        return Ok(status.into_response());
    }
    Ok((status, Json(ApplyStatus { key, outcome })).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ListQuery {
    group: String,
    version: String,
    kind: String,
    account: String,
    name: String,
    name_prefix: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> ListFilter {
        let filter = ListFilter::new(ObjectKey::new(self.group, self.version, self.kind, self.account, self.name));
        match self.name_prefix.filter(|p| !p.is_empty()) {
            Some(p) => filter.with_name_prefix(p),
            None => filter,
        }
    }
}

async fn list_objects(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<ListQuery>) -> Response {
    let t0 = Instant::now();
    let res = async {
        authorize(&state, &headers).await?;
        let filter = q.into_filter();
        let list = state.api.list(&request_ctx(&state), &filter).await?;
        Ok::<_, ApiError>(Json(list).into_response())
    }
    .await;
    finish("list", t0, res)
}

type KeyPath = Path<(String, String, String, String, String)>;

async fn get_object(State(state): State<AppState>, headers: HeaderMap, Path((g, v, k, a, n)): KeyPath) -> Response {
    let t0 = Instant::now();
    let res = async {
        authorize(&state, &headers).await?;
        let key = ObjectKey::new(g, v, k, a, n);
        let obj = state.api.get(&request_ctx(&state), &key).await?;
        Ok::<_, ApiError>(Json(obj).into_response())
    }
    .await;
    finish("get", t0, res)
}

async fn delete_object(State(state): State<AppState>, headers: HeaderMap, Path((g, v, k, a, n)): KeyPath) -> Response {
    let t0 = Instant::now();
    let res = async {
        authorize(&state, &headers).await?;
        let key = ObjectKey::new(g, v, k, a, n);
        let outcome = state.api.delete(&request_ctx(&state), &key).await?;
        Ok::<_, ApiError>(Json(DeleteStatus { key, outcome }).into_response())
    }
    .await;
    finish("delete", t0, res)
}

async fn list_kinds(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let t0 = Instant::now();
    let res = async {
        authorize(&state, &headers).await?;
        let kinds = state.api.kinds(&request_ctx(&state)).await?;
        Ok::<_, ApiError>(Json(kinds).into_response())
    }
    .await;
    finish("kinds", t0, res)
}
