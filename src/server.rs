use std::{net::SocketAddr, sync::Arc};

use axum::http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING,
};
use axum::response::IntoResponse;
use axum::{
    Router,
    body::{self, Body},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode},
    middleware::{self, Next},
    response::Json,
    routing::{any, delete, get, patch, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    App, ProxyError, Settings,
    config::ClientKeyRejection,
    health::SweepReport,
    keys::KeyRecord,
    models::ModelInfo,
    proxy::{ProxyReply, ProxyRequest, ProxyResponse, RegistrationResult},
    selection::{KeyMode, KeyModeState},
    store::{DailyStats, DaySummary},
    usage::CurrentStats,
};

const BODY_LIMIT: usize = 16 * 1024 * 1024; // 16 MiB 默认限制

/// 不带 `/v1` 前缀也接受的 OpenAI 兼容路径。
const VERSIONLESS_ROUTES: &[&str] = &[
    "/chat/completions",
    "/completions",
    "/embeddings",
    "/images/generations",
    "/rerank",
    "/models",
    "/user/info",
];

async fn health_check() -> &'static str {
    "ok"
}

/// 组装全部路由。
pub fn router(app: App) -> Router {
    let state = Arc::new(app);

    let mut proxy = Router::new()
        .route("/v1", any(proxy_handler))
        .route("/v1/*path", any(proxy_handler))
        .route("/api/*path", any(proxy_handler));
    for path in VERSIONLESS_ROUTES {
        proxy = proxy.route(path, any(proxy_handler));
    }
    let proxy = proxy.route_layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        require_client_key,
    ));

    Router::new()
        .route("/health", get(health_check))
        .route("/admin/summary", get(fetch_summary))
        .route("/admin/keys", get(list_keys).post(create_api_key))
        .route("/admin/keys/batch", post(create_api_keys))
        .route("/admin/keys/purge", post(purge_api_keys))
        .route("/admin/keys/mode", get(get_key_mode).post(set_key_mode))
        .route("/admin/keys/refresh", post(refresh_balances))
        .route("/admin/keys/:key", delete(delete_api_key))
        .route("/admin/keys/:key/status", patch(update_api_key_status))
        .route("/admin/stats/current", get(current_stats))
        .route("/admin/stats/daily", get(list_daily_stats))
        .route("/admin/stats/daily/:date", get(get_daily_stats))
        .route("/admin/settings", get(get_settings).put(put_settings))
        .route("/admin/models", get(list_models).post(save_model))
        .route("/admin/models/sync", post(sync_models))
        .merge(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, app: App) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    info!("key pool gateway listening on http://{bound_addr}");

    axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// 开启客户端鉴权时，依次从 Authorization、`api_key` 查询参数、
/// 表单字段中取 key 并与配置比对。
async fn require_client_key(
    State(state): State<Arc<App>>,
    req: Request<Body>,
    next: Next,
) -> Response<Body> {
    let security = state.store().settings().snapshot().await.security;
    if !security.api_key_enabled {
        return next.run(req).await;
    }

    let mut presented = header_key(req.headers()).or_else(|| query_key(req.uri().query()));
    let req = if presented.is_none() && is_form_post(&req) {
        let (parts, body) = req.into_parts();
        let Ok(bytes) = body::to_bytes(body, BODY_LIMIT).await else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        presented = form_key(&bytes);
        Request::from_parts(parts, Body::from(bytes))
    } else {
        req
    };

    match security.check(presented.as_deref()) {
        Ok(()) => next.run(req).await,
        Err(rejection) => {
            info!(path = %req.uri().path(), ?rejection, "rejected client request");
            let message = match rejection {
                ClientKeyRejection::Missing => {
                    "provide a valid API key in the Authorization header"
                }
                ClientKeyRejection::Invalid => "invalid API key",
            };
            error_response(&ProxyError::Unauthorized(message))
        }
    }
}

fn header_key(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw).trim().to_owned())
}

fn query_key(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(name, value)| name == "api_key" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn form_key(body: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(body)
        .find(|(name, value)| name == "api_key" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn is_form_post(req: &Request<Body>) -> bool {
    req.method() == Method::POST
        && req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

async fn proxy_handler(
    State(state): State<Arc<App>>,
    req: Request<Body>,
) -> Result<Response<Body>, StatusCode> {
    let (parts, body) = req.into_parts();
    let body_bytes = body::to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let proxy_request = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_owned(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts.headers,
        body: body_bytes,
    };

    match state.gateway.proxy_request(proxy_request).await {
        Ok(ProxyReply::Buffered(resp)) => Ok(build_response(resp)),
        Ok(ProxyReply::Stream {
            status,
            headers,
            body,
        }) => {
            let mut builder = Response::builder().status(status);
            if let Some(target) = builder.headers_mut() {
                target.extend(headers);
            }
            builder
                .body(Body::from_stream(body))
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(err) => {
            if err.is_no_eligible_key() {
                error!("proxy error: {err}");
            } else {
                warn!("proxy error: {err}");
            }
            Ok(error_response(&err))
        }
    }
}

/// OpenAI 风格的错误响应。
fn error_response(err: &ProxyError) -> Response<Body> {
    let status = err.status_code();
    let payload = json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type(),
            "code": status.as_u16(),
        }
    });
    (status, Json(payload)).into_response()
}

fn build_response(resp: ProxyResponse) -> Response<Body> {
    let mut builder = Response::builder().status(resp.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in resp.headers.iter() {
            if name == TRANSFER_ENCODING || name == CONNECTION || name == CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(CONTENT_LENGTH, value_from_len(resp.body.len()));
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn value_from_len(len: usize) -> HeaderValue {
    HeaderValue::from_str(len.to_string().as_str())
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// 管理接口的错误：状态码加简短说明。
fn admin_error(context: &str, err: ProxyError) -> (StatusCode, Json<ErrorView>) {
    let status = err.status_code();
    if status.is_server_error() {
        error!("{context}: {err}");
    } else {
        warn!("{context}: {err}");
    }
    (
        status,
        Json(ErrorView {
            error: err.to_string(),
        }),
    )
}

type AdminResult<T> = Result<T, (StatusCode, Json<ErrorView>)>;

#[derive(Debug, Serialize)]
struct ErrorView {
    error: String,
}

#[derive(Debug, Serialize)]
struct ApiKeyView {
    id: String,
    key: String,
    balance: f64,
    score: f64,
    disabled: bool,
    disabled_at: Option<i64>,
    last_used: Option<i64>,
    last_tested: Option<i64>,
    total_calls: u64,
    success_calls: u64,
    success_rate: f64,
    consecutive_failures: u32,
    rpm: u64,
    tpm: u64,
    is_used: bool,
}

fn normalize_timestamp(timestamp: i64) -> Option<i64> {
    (timestamp > 0).then_some(timestamp)
}

impl From<KeyRecord> for ApiKeyView {
    fn from(record: KeyRecord) -> Self {
        Self {
            id: record.id(),
            key: record.masked(),
            balance: record.balance,
            score: record.score,
            disabled: record.disabled,
            disabled_at: normalize_timestamp(record.disabled_at),
            last_used: normalize_timestamp(record.last_used),
            last_tested: normalize_timestamp(record.last_tested),
            total_calls: record.total_calls,
            success_calls: record.success_calls,
            success_rate: record.success_rate,
            consecutive_failures: record.consecutive_failures,
            rpm: record.rpm,
            tpm: record.tpm,
            is_used: record.is_used,
        }
    }
}

#[derive(Debug, Serialize)]
struct SummaryView {
    total_keys: usize,
    active_keys: usize,
    disabled_keys: usize,
    total_balance: f64,
    key_mode: KeyMode,
    stats: CurrentStats,
}

async fn fetch_summary(State(state): State<Arc<App>>) -> Json<SummaryView> {
    let store = state.store();
    let all = store.list().await;
    let active = store.list_active().await;
    Json(SummaryView {
        total_keys: all.len(),
        active_keys: active.len(),
        disabled_keys: all.iter().filter(|record| record.disabled).count(),
        total_balance: all.iter().map(|record| record.balance).sum(),
        key_mode: state.gateway.key_mode().mode,
        stats: state.gateway.usage().current(),
    })
}

async fn list_keys(State(state): State<Arc<App>>) -> Json<Vec<ApiKeyView>> {
    let records = state.store().list().await;
    Json(records.into_iter().map(ApiKeyView::from).collect())
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    api_key: String,
    balance: Option<f64>,
    #[serde(default)]
    force: bool,
}

async fn create_api_key(
    State(state): State<Arc<App>>,
    Json(payload): Json<CreateKeyRequest>,
) -> AdminResult<(StatusCode, Json<ApiKeyView>)> {
    let api_key = payload.api_key.trim();
    if api_key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorView {
                error: "api_key is required".into(),
            }),
        ));
    }

    state
        .gateway
        .register_key(api_key, payload.balance, payload.force)
        .await
        .map(|record| (StatusCode::CREATED, Json(record.into())))
        .map_err(|err| admin_error("create api key error", err))
}

#[derive(Debug, Deserialize)]
struct BatchCreateRequest {
    keys: Vec<String>,
    #[serde(default)]
    force: bool,
}

async fn create_api_keys(
    State(state): State<Arc<App>>,
    Json(payload): Json<BatchCreateRequest>,
) -> Json<Vec<RegistrationResult>> {
    let keys: Vec<String> = payload
        .keys
        .iter()
        .flat_map(|entry| entry.split([',', '\n']))
        .map(|key| key.trim().to_owned())
        .filter(|key| !key.is_empty())
        .collect();
    Json(state.gateway.register_keys(&keys, payload.force).await)
}

async fn delete_api_key(
    State(state): State<Arc<App>>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    let Some(record) = state.store().resolve(&id).await else {
        return Err(admin_error("delete api key error", ProxyError::KeyNotFound(id)));
    };
    state
        .store()
        .mark_deleted(&record.key)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|err| admin_error("delete api key error", err))
}

#[derive(Debug, Serialize)]
struct PurgeView {
    removed: usize,
}

async fn purge_api_keys(State(state): State<Arc<App>>) -> AdminResult<Json<PurgeView>> {
    state
        .store()
        .purge_deleted()
        .await
        .map(|removed| Json(PurgeView { removed }))
        .map_err(|err| admin_error("purge api keys error", err))
}

#[derive(Debug, Deserialize)]
struct UpdateKeyStatus {
    status: String,
}

async fn update_api_key_status(
    State(state): State<Arc<App>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateKeyStatus>,
) -> AdminResult<StatusCode> {
    let Some(record) = state.store().resolve(&id).await else {
        return Err(admin_error("update key status error", ProxyError::KeyNotFound(id)));
    };

    let status = payload.status.trim().to_ascii_lowercase();
    let result = match status.as_str() {
        "disabled" => state.store().set_disabled(&record.key).await,
        "active" => state.store().set_enabled(&record.key).await,
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorView {
                    error: format!("unknown status '{status}'"),
                }),
            ));
        }
    };
    state.store().sort_by_priority().await;
    result
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|err| admin_error("update key status error", err))
}

#[derive(Debug, Serialize)]
struct KeyModeView {
    mode: KeyMode,
    keys: Vec<String>,
}

impl From<KeyModeState> for KeyModeView {
    fn from(state: KeyModeState) -> Self {
        Self {
            mode: state.mode,
            keys: state.keys.iter().map(|key| crate::key_id(key)).collect(),
        }
    }
}

async fn get_key_mode(State(state): State<Arc<App>>) -> Json<KeyModeView> {
    Json(state.gateway.key_mode().into())
}

#[derive(Debug, Deserialize)]
struct SetKeyModeRequest {
    mode: String,
    #[serde(default)]
    keys: Vec<String>,
}

async fn set_key_mode(
    State(state): State<Arc<App>>,
    Json(payload): Json<SetKeyModeRequest>,
) -> AdminResult<Json<KeyModeView>> {
    let mode =
        KeyMode::parse(&payload.mode).map_err(|err| admin_error("set key mode error", err))?;
    state
        .gateway
        .set_key_mode(mode, &payload.keys)
        .await
        .map_err(|err| admin_error("set key mode error", err))?;
    Ok(Json(state.gateway.key_mode().into()))
}

async fn refresh_balances(State(state): State<Arc<App>>) -> Json<SweepReport> {
    Json(state.health.refresh_all().await)
}

async fn current_stats(State(state): State<Arc<App>>) -> Json<CurrentStats> {
    Json(state.gateway.usage().current())
}

async fn list_daily_stats(State(state): State<Arc<App>>) -> AdminResult<Json<Vec<DaySummary>>> {
    state
        .database
        .recent_days()
        .await
        .map(Json)
        .map_err(|err| admin_error("daily stats error", err))
}

async fn get_daily_stats(
    State(state): State<Arc<App>>,
    Path(date): Path<String>,
) -> AdminResult<Json<DailyStats>> {
    let Ok(date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorView {
                error: format!("invalid date '{date}', expected YYYY-MM-DD"),
            }),
        ));
    };
    match state.database.daily_stats(date).await {
        Ok(Some(stats)) => Ok(Json(stats)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorView {
                error: format!("no usage recorded on {date}"),
            }),
        )),
        Err(err) => Err(admin_error("daily stats error", err)),
    }
}

async fn get_settings(State(state): State<Arc<App>>) -> Json<Settings> {
    Json(state.store().settings().snapshot().await)
}

async fn put_settings(
    State(state): State<Arc<App>>,
    Json(settings): Json<Settings>,
) -> AdminResult<Json<Settings>> {
    state
        .update_settings(settings)
        .await
        .map(Json)
        .map_err(|err| admin_error("update settings error", err))
}

async fn list_models(State(state): State<Arc<App>>) -> AdminResult<Json<Vec<ModelInfo>>> {
    state
        .gateway
        .models()
        .list_models()
        .await
        .map(Json)
        .map_err(|err| admin_error("list models error", err))
}

async fn save_model(
    State(state): State<Arc<App>>,
    Json(model): Json<ModelInfo>,
) -> AdminResult<Json<ModelInfo>> {
    let id = model.id.trim().to_owned();
    if id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorView {
                error: "model id is required".into(),
            }),
        ));
    }
    let model = ModelInfo { id, ..model };
    let registry = state.gateway.models();
    registry
        .save_model(&model)
        .await
        .map_err(|err| admin_error("save model error", err))?;
    info!(model = %model.id, model_type = ?model.model_type, "model registered");
    match registry.find_model(&model.id).await {
        Ok(Some(saved)) => Ok(Json(saved)),
        Ok(None) => Ok(Json(model)),
        Err(err) => Err(admin_error("save model error", err)),
    }
}

#[derive(Debug, Serialize)]
struct SyncView {
    synced: usize,
}

async fn sync_models(State(state): State<Arc<App>>) -> AdminResult<Json<SyncView>> {
    state
        .gateway
        .sync_models()
        .await
        .map(|synced| Json(SyncView { synced }))
        .map_err(|err| admin_error("sync models error", err))
}
