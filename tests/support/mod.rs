//! 集成测试共用的 upstream 替身与网关装配。

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, Request, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use keypool_gateway::{App, server};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

/// upstream 收到的请求：Authorization 头与请求体。
#[derive(Debug, Clone)]
pub struct Seen {
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    fn push(&self, headers: &HeaderMap, body: &[u8]) {
        let authorization = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = serde_json::from_slice(body).unwrap_or(Value::Null);
        self.seen.lock().unwrap().push(Seen {
            authorization,
            body,
        });
    }

    pub fn all(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last(&self) -> Seen {
        self.all().pop().expect("upstream saw no requests")
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_owned()
}

async fn user_info(headers: HeaderMap) -> Json<Value> {
    let key = bearer(&headers);
    let balance = if key.starts_with("sk-empty") {
        "0"
    } else if key.starts_with("sk-low") {
        "0.5"
    } else {
        "9.5"
    };
    Json(json!({
        "code": 20000,
        "message": "OK",
        "status": true,
        "data": {"totalBalance": balance}
    }))
}

async fn chat(
    axum::extract::State(recorder): axum::extract::State<Recorder>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    recorder.push(&headers, &body);
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let model = request["model"].as_str().unwrap_or_default().to_owned();

    if model == "broken" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"message": "upstream exploded"}})),
        )
            .into_response();
    }

    if request["stream"] == Value::Bool(true) {
        let frames = [
            json!({"id": "c1", "model": model, "choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
            json!({"id": "c1", "model": model, "choices": [{"index": 0, "delta": {"content": "lo"}}]}),
        ];
        let text: String = frames
            .iter()
            .map(|frame| format!("data: {frame}\n\n"))
            .collect();
        return Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from(text))
            .unwrap();
    }

    let mut reply = json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello there"},
            "finish_reason": "stop"
        }]
    });
    if model != "no-usage" {
        reply["usage"] = json!({"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12});
    }
    Json(reply).into_response()
}

async fn models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{"id": "allowed-model"}, {"id": "blocked-model"}]
    }))
}

async fn embeddings(
    axum::extract::State(recorder): axum::extract::State<Recorder>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    recorder.push(&headers, &body);
    Json(json!({"data": {"embedding": [0.1, 0.2, 0.3]}, "usage": {"prompt_tokens": 3}}))
}

/// 在随机端口启动 upstream 替身，返回基础地址。
pub async fn spawn_upstream(recorder: Recorder) -> String {
    let app = Router::new()
        .route("/v1/user/info", get(user_info))
        .route("/v1/chat/completions", post(chat))
        .route("/v1/models", get(models))
        .route("/v1/embeddings", post(embeddings))
        .with_state(recorder);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// 网关与其依赖；`_dir` 持有临时数据库目录。
pub struct Harness {
    pub app: App,
    pub recorder: Recorder,
    _dir: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        let recorder = Recorder::default();
        let upstream = spawn_upstream(recorder.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("keypool.db");
        let app = App::with_endpoint(&upstream, db_path.to_str().unwrap())
            .await
            .unwrap();
        Self {
            app,
            recorder,
            _dir: dir,
        }
    }

    /// 登记若干 key，余额由 upstream 替身给出。
    pub async fn with_keys(keys: &[&str]) -> Self {
        let harness = Self::start().await;
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        let results = harness.app.gateway.register_keys(&keys, false).await;
        assert!(results.iter().all(|result| result.ok), "{results:?}");
        harness
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = server::router(self.app.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    pub async fn send_json(&self, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, bytes) = self.send(request).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, _, bytes) = self.send(request).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}
