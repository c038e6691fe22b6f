use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{
    Client, Method, StatusCode, Url,
    header::{
        ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, HOST,
        HeaderMap, HeaderName, HeaderValue,
    },
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    classify::{Classification, Endpoint, classify},
    config::Settings,
    error::{ProbeError, ProxyError},
    keys::{KeyRecord, KeyStore, mask_key},
    models::ModelInfo,
    payload::{PreparedRequest, REASONING_TIMEOUT_SECS, prepare_request},
    selection::{KeyMode, KeyModeState, SelectionContext, Selector, Strategy},
    store::ModelRegistry,
    stream::{FakeStream, SseStream, StreamConfig, relay},
    transform::transform_response,
    upstream::{UpstreamEndpoint, UpstreamProbe},
    usage::{UsageRecorder, UsageReport},
};

/// 不转发给 upstream 的代理链路头。
const BLOCKED_HEADERS: &[&str] = &[
    "forwarded",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-real-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "cf-ray",
    "cf-visitor",
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
];

const UNKNOWN_MODEL: &str = "unknown";

/// 客户端请求描述。
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 完整读取后的 upstream 响应。
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 代理结果：一次性响应或 SSE 流。
#[derive(Debug)]
pub enum ProxyReply {
    Buffered(ProxyResponse),
    Stream {
        status: StatusCode,
        headers: HeaderMap,
        body: SseStream,
    },
}

/// 请求的转发目标。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    /// OpenAI 兼容接口，路径不含 `/v1` 前缀。
    OpenAi(&'a str),
    /// `/api/*` 原样透传。
    Raw(&'a str),
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Self {
        if path.starts_with("/api/") {
            return Route::Raw(path);
        }
        let rest = path.strip_prefix("/v1").unwrap_or(path);
        Route::OpenAi(if rest.is_empty() { "/" } else { rest })
    }

    fn sub_path(self) -> &'a str {
        match self {
            Route::OpenAi(path) | Route::Raw(path) => path,
        }
    }
}

/// 一次转发的上下文，贯穿选 key、改写与回灌。
struct Attempt<'a> {
    request: &'a ProxyRequest,
    classification: Classification,
    prepared: PreparedRequest,
    key: String,
    fake_stream: bool,
}

impl Attempt<'_> {
    fn model(&self) -> String {
        self.prepared
            .model
            .clone()
            .or_else(|| self.classification.model.clone())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string())
    }

    fn wants_stream(&self) -> bool {
        self.prepared.stream || self.classification.stream
    }
}

/// 管理接口批量登记的单条结果。
#[derive(Debug, Serialize)]
pub struct RegistrationResult {
    pub key: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 负责在 key 池中选 key 并转发 OpenAI 兼容请求的网关。
pub struct Gateway {
    client: Client,
    upstream: UpstreamEndpoint,
    store: Arc<KeyStore>,
    selector: Selector,
    usage: Arc<UsageRecorder>,
    probe: Arc<dyn UpstreamProbe>,
    models: Arc<dyn ModelRegistry>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("upstream", &self.upstream.as_str())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        client: Client,
        upstream: UpstreamEndpoint,
        store: Arc<KeyStore>,
        usage: Arc<UsageRecorder>,
        probe: Arc<dyn UpstreamProbe>,
        models: Arc<dyn ModelRegistry>,
    ) -> Self {
        Self {
            client,
            upstream,
            store,
            selector: Selector::new(),
            usage,
            probe,
            models,
        }
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    pub fn usage(&self) -> &Arc<UsageRecorder> {
        &self.usage
    }

    pub fn upstream(&self) -> &UpstreamEndpoint {
        &self.upstream
    }

    pub fn models(&self) -> &Arc<dyn ModelRegistry> {
        &self.models
    }

    /// 转发一次请求：分类、选 key、改写请求体、发送并回灌用量。
    pub async fn proxy_request(&self, request: ProxyRequest) -> Result<ProxyReply, ProxyError> {
        let route = Route::parse(&request.path);
        let settings = self.store.settings().snapshot().await;
        let classification = classify(route.sub_path(), &request.body);
        let endpoint = match route {
            Route::Raw(_) => Endpoint::Other,
            Route::OpenAi(_) => classification.endpoint,
        };

        if let Some(model) = classification.model.as_deref()
            && settings.is_model_disabled(model)
        {
            info!(model, "rejected request for disabled model");
            return Err(ProxyError::ModelDisabled(model.to_owned()));
        }

        let registered = self.registered_model(classification.model.as_deref()).await;
        let records = self.store.list().await;
        let ctx = SelectionContext::new(
            classification.kind,
            classification.model.clone(),
            classification.estimated_tokens,
        )
        .with_registered_strategy(
            registered
                .as_ref()
                .and_then(|model| model.strategy)
                .map(Strategy::from_id),
        );
        let key = self.selector.select(&records, &settings, &ctx)?;
        let prepared = prepare_request(
            endpoint,
            request.body.clone(),
            &settings.defaults,
            registered.as_ref().map(|model| model.model_type),
        )?;
        self.store.touch(&key).await;

        let fake_stream = settings.proxy.fake_streaming
            && endpoint == Endpoint::ChatCompletions
            && (prepared.stream || classification.stream);
        let attempt = Attempt {
            request: &request,
            classification,
            prepared,
            key,
            fake_stream,
        };

        let url = match route {
            Route::Raw(path) => self.upstream.url(path, request.query.as_deref()),
            Route::OpenAi(path) => self.upstream.v1(path, request.query.as_deref()),
        };
        self.forward(attempt, endpoint, url, &settings).await
    }

    /// 登记表查询失败时按未登记处理，不影响转发。
    async fn registered_model(&self, model: Option<&str>) -> Option<ModelInfo> {
        let model = model?;
        match self.models.find_model(model).await {
            Ok(found) => found,
            Err(err) => {
                warn!(model, error = %err, "model registry lookup failed");
                None
            }
        }
    }

    async fn forward(
        &self,
        attempt: Attempt<'_>,
        endpoint: Endpoint,
        url: Url,
        settings: &Settings,
    ) -> Result<ProxyReply, ProxyError> {
        let request = attempt.request;
        let streaming = attempt.wants_stream() && !attempt.fake_stream;
        let body = if attempt.fake_stream {
            without_stream(&attempt.prepared.body)
        } else {
            attempt.prepared.body.clone()
        };

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(forwardable_headers(&request.headers))
            .header(AUTHORIZATION, format!("Bearer {}", attempt.key));
        if !streaming {
            let timeout = if attempt.prepared.reasoning {
                REASONING_TIMEOUT_SECS
            } else {
                settings.proxy.standard_timeout
            };
            builder = builder.timeout(Duration::from_secs(timeout.max(1)));
        }

        let response = match builder.body(body).send().await {
            Ok(response) => response,
            Err(err) => {
                log_error(&attempt.key, request, &err);
                self.report(&attempt, 0, 0, false).await;
                return Err(ProxyError::Http(err));
            }
        };

        let status = response.status();
        log_success(&attempt.key, request, status);
        let headers = response.headers().clone();

        if streaming && status.is_success() {
            let mut config = StreamConfig::from(&settings.proxy);
            config.reasoning = attempt.prepared.reasoning;
            let (body, handle) = relay(response.bytes_stream(), config);
            let usage = Arc::clone(&self.usage);
            let store = Arc::clone(&self.store);
            let key = attempt.key.clone();
            let model = attempt.model();
            tokio::spawn(async move {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(error = %err, "stream relay task failed");
                        return;
                    }
                };
                let (prompt_tokens, completion_tokens) = outcome.split_tokens();
                usage
                    .report(
                        &store,
                        UsageReport {
                            key,
                            model,
                            prompt_tokens,
                            completion_tokens,
                            success: outcome.is_success(),
                        },
                    )
                    .await;
            });
            return Ok(ProxyReply::Stream {
                status,
                headers: sse_headers(),
                body,
            });
        }

        let raw = match response.bytes().await {
            Ok(raw) => raw,
            Err(err) => {
                log_error(&attempt.key, request, &err);
                self.report(&attempt, 0, 0, false).await;
                return Err(ProxyError::Http(err));
            }
        };

        let body = match endpoint {
            Endpoint::Models if status == StatusCode::OK => filter_models(&raw, settings),
            Endpoint::Models | Endpoint::UserInfo | Endpoint::Other => raw,
            _ => transform_response(&raw),
        };

        let (prompt_tokens, completion_tokens) = response_tokens(&body)
            .unwrap_or_else(|| split_estimate(attempt.classification.estimated_tokens));
        self.report(&attempt, prompt_tokens, completion_tokens, status.is_success())
            .await;

        if attempt.fake_stream
            && status.is_success()
            && let Some(fake) = FakeStream::from_completion(&body)
        {
            debug!(key = %mask_key(&attempt.key), "replaying completion as fake stream");
            return Ok(ProxyReply::Stream {
                status,
                headers: sse_headers(),
                body: fake.spawn(),
            });
        }

        Ok(ProxyReply::Buffered(ProxyResponse {
            status,
            headers,
            body,
        }))
    }

    async fn report(
        &self,
        attempt: &Attempt<'_>,
        prompt_tokens: u64,
        completion_tokens: u64,
        success: bool,
    ) {
        self.usage
            .report(
                &self.store,
                UsageReport {
                    key: attempt.key.clone(),
                    model: attempt.model(),
                    prompt_tokens,
                    completion_tokens,
                    success,
                },
            )
            .await;
    }

    /// 登记 key。未给出余额时向 upstream 查询；余额非正时除非 `force` 否则拒绝。
    pub async fn register_key(
        &self,
        key: &str,
        balance: Option<f64>,
        force: bool,
    ) -> Result<KeyRecord, ProxyError> {
        let key = key.trim();
        let balance = match balance {
            Some(balance) => balance,
            None => self.probe.check_balance(key).await?,
        };
        if balance <= 0.0 && !force {
            return Err(ProxyError::NonPositiveBalance(balance));
        }
        let record = self.store.add(key, balance).await?;
        self.store.sort_by_priority().await;
        Ok(record)
    }

    /// 逐个登记，单个失败不影响其余。
    pub async fn register_keys(&self, keys: &[String], force: bool) -> Vec<RegistrationResult> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys.iter().map(|key| key.trim()).filter(|key| !key.is_empty()) {
            let result = match self.register_key(key, None, force).await {
                Ok(record) => RegistrationResult {
                    key: record.masked(),
                    ok: true,
                    balance: Some(record.balance),
                    disabled: Some(record.disabled),
                    error: None,
                },
                Err(err) => {
                    warn!(key = %mask_key(key), error = %err, "failed to register key");
                    RegistrationResult {
                        key: mask_key(key),
                        ok: false,
                        balance: None,
                        disabled: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            results.push(result);
        }
        results
    }

    /// 用一个可用 key 拉取 upstream 模型列表并同步到登记表，返回模型数。
    pub async fn sync_models(&self) -> Result<usize, ProxyError> {
        let key = self
            .store
            .list_active()
            .await
            .into_iter()
            .next()
            .map(|record| record.key)
            .ok_or_else(|| ProxyError::NoEligibleKey("no active key to list models".into()))?;

        let response = self
            .client
            .get(self.upstream.v1("/models", None))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .send()
            .await
            .map_err(ProxyError::Http)?;
        let status = response.status();
        let body = response.bytes().await.map_err(ProxyError::Http)?;
        if status != StatusCode::OK {
            return Err(ProbeError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .into());
        }

        let ids = model_ids(&body)?;
        self.models.sync_models(&ids).await
    }

    pub fn key_mode(&self) -> KeyModeState {
        self.selector.mode()
    }

    /// 切换 key 模式，`keys` 可以是短标识或明文，必须都在池中。
    pub async fn set_key_mode(&self, mode: KeyMode, keys: &[String]) -> Result<(), ProxyError> {
        let mut resolved = Vec::with_capacity(keys.len());
        if mode != KeyMode::All {
            for key in keys.iter().map(|key| key.trim()).filter(|key| !key.is_empty()) {
                let record = self
                    .store
                    .resolve(key)
                    .await
                    .ok_or_else(|| ProxyError::KeyNotFound(mask_key(key)))?;
                resolved.push(record.key);
            }
        }
        self.selector.set_mode(mode, resolved)?;
        info!(mode = mode.as_str(), keys = keys.len(), "key mode changed");
        Ok(())
    }
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers.iter() {
        if should_forward_header(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

fn should_forward_header(name: &HeaderName) -> bool {
    // Host/Content-Length 由 reqwest 重算，Authorization 换成池中的 key。
    if [HOST, CONTENT_LENGTH, AUTHORIZATION, ACCEPT_ENCODING].contains(name) {
        return false;
    }
    let lower = name.as_str();
    !BLOCKED_HEADERS.contains(&lower)
}

fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers
}

/// 把请求体中的 `stream` 置为 false，用于伪流式。
fn without_stream(body: &Bytes) -> Bytes {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(mut map)) => {
            map.insert("stream".into(), Value::Bool(false));
            serde_json::to_vec(&map)
                .map(Bytes::from)
                .unwrap_or_else(|_| body.clone())
        }
        _ => body.clone(),
    }
}

/// 去掉 `/models` 列表中被禁用的模型。
fn filter_models(body: &Bytes, settings: &Settings) -> Bytes {
    if settings.pool.disabled_models.is_empty() {
        return body.clone();
    }
    let Ok(Value::Object(mut value)) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    let Some(Value::Array(models)) = value.get_mut("data") else {
        return body.clone();
    };
    models.retain(|model| {
        model
            .get("id")
            .and_then(Value::as_str)
            .is_none_or(|id| !settings.is_model_disabled(id))
    });
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .unwrap_or_else(|_| body.clone())
}

/// `/models` 响应中 `data[].id` 的列表，缺失 `data` 时为空。
fn model_ids(body: &[u8]) -> Result<Vec<String>, ProxyError> {
    let value: Value = serde_json::from_slice(body).map_err(ProbeError::Decode)?;
    let ids = value
        .get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|model| model.get("id").and_then(Value::as_str))
        .map(str::to_owned)
        .collect();
    Ok(ids)
}

/// 响应 usage 中的 (prompt, completion)。
fn response_tokens(body: &[u8]) -> Option<(u64, u64)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if prompt == 0 && completion == 0 {
        let total = usage.get("total_tokens").and_then(Value::as_u64)?;
        return (total > 0).then(|| split_estimate(total as usize));
    }
    Some((prompt, completion))
}

/// 估算值平分为输入与输出。
fn split_estimate(estimated: usize) -> (u64, u64) {
    let estimated = estimated as u64;
    let prompt = estimated / 2;
    (prompt, estimated - prompt)
}

fn compose_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_owned(),
    }
}

fn log_success(key: &str, request: &ProxyRequest, status: StatusCode) {
    let full_path = compose_path(&request.path, request.query.as_deref());
    info!("[{}] {} {full_path} -> {status}", mask_key(key), request.method);
}

fn log_error(key: &str, request: &ProxyRequest, err: &reqwest::Error) {
    let full_path = compose_path(&request.path, request.query.as_deref());
    warn!("[{}] {} {full_path} !! {err}", mask_key(key), request.method);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;

    #[test]
    fn routes_strip_version_prefix_and_keep_raw_api_paths() {
        assert_eq!(
            Route::parse("/v1/chat/completions"),
            Route::OpenAi("/chat/completions")
        );
        assert_eq!(Route::parse("/embeddings"), Route::OpenAi("/embeddings"));
        assert_eq!(Route::parse("/v1"), Route::OpenAi("/"));
        assert_eq!(Route::parse("/api/v1/foo"), Route::Raw("/api/v1/foo"));
    }

    #[test]
    fn client_authorization_and_hop_headers_are_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client"));
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let forwarded = forwardable_headers(&headers);
        assert!(forwarded.get(AUTHORIZATION).is_none());
        assert!(forwarded.get(HOST).is_none());
        assert!(forwarded.get("x-forwarded-for").is_none());
        assert_eq!(forwarded.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(forwarded.get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn disabled_models_are_filtered_from_listing() {
        let settings = Settings {
            pool: PoolSettings {
                disabled_models: vec!["deepseek-ai/DeepSeek-R1".into()],
                ..PoolSettings::default()
            },
            ..Settings::default()
        };
        let body = Bytes::from_static(
            br#"{"object":"list","data":[{"id":"deepseek-ai/DeepSeek-R1"},{"id":"Qwen/Qwen2.5-7B-Instruct"}]}"#,
        );
        let filtered: Value = serde_json::from_slice(&filter_models(&body, &settings)).unwrap();
        let ids: Vec<&str> = filtered["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|model| model["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["Qwen/Qwen2.5-7B-Instruct"]);

        let untouched = Bytes::from_static(b"not json");
        assert_eq!(filter_models(&untouched, &settings), untouched);
    }

    #[test]
    fn token_split_prefers_reported_usage() {
        assert_eq!(
            response_tokens(br#"{"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#),
            Some((7, 3))
        );
        assert_eq!(response_tokens(br#"{"usage":{"total_tokens":9}}"#), Some((4, 5)));
        assert_eq!(response_tokens(br#"{"usage":{"prompt_tokens":0}}"#), None);
        assert_eq!(response_tokens(b"{}"), None);
        assert_eq!(split_estimate(11), (5, 6));
    }

    #[test]
    fn fake_stream_request_disables_upstream_streaming() {
        let body = Bytes::from_static(br#"{"model":"m","stream":true,"messages":[]}"#);
        let value: Value = serde_json::from_slice(&without_stream(&body)).unwrap();
        assert_eq!(value["stream"], false);
        assert_eq!(value["model"], "m");
    }

    #[test]
    fn model_listing_ids_skip_malformed_entries() {
        let ids = model_ids(br#"{"data":[{"id":"a"},{"object":"model"},{"id":7},{"id":"b"}]}"#)
            .unwrap();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(model_ids(br#"{"object":"list"}"#).unwrap().is_empty());
        assert!(model_ids(b"nope").is_err());
    }
}
