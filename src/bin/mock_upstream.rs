use std::{convert::Infallible, net::SocketAddr, time::Duration};

use async_stream::stream;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rand::Rng;
use serde_json::{Value, json};

const REPLY: &str = "你好！This is a mock completion from the local upstream.";

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|key| key.trim().to_owned())
}

/// `sk-empty*` 余额为 0，`sk-low*` 低于默认阈值，`sk-bad*` 被拒绝，其余随机。
async fn user_info(headers: HeaderMap) -> Response {
    let Some(key) = bearer(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing key").into_response();
    };
    if key.starts_with("sk-bad") {
        let body = json!({"code": 30001, "message": "invalid api key", "status": false});
        return Json(body).into_response();
    }
    let balance = if key.starts_with("sk-empty") {
        0.0
    } else if key.starts_with("sk-low") {
        0.5
    } else {
        rand::thread_rng().gen_range(1.0..20.0)
    };
    Json(json!({
        "code": 20000,
        "message": "OK",
        "status": true,
        "data": {"totalBalance": format!("{balance:.4}")}
    }))
    .into_response()
}

async fn chat_completions(headers: HeaderMap, body: Bytes) -> Response {
    if bearer(&headers).is_none_or(|key| key.starts_with("sk-bad")) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": 401, "message": "invalid api key"})),
        )
            .into_response();
    }
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let model = request
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock-model")
        .to_owned();

    if request.get("stream").and_then(Value::as_bool) == Some(true) {
        return stream_reply(model);
    }

    let latency = rand::thread_rng().gen_range(5..50);
    tokio::time::sleep(Duration::from_millis(latency)).await;
    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": REPLY},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 20, "total_tokens": 32}
    }))
    .into_response()
}

fn stream_reply(model: String) -> Response {
    let events = stream! {
        for piece in REPLY.split_inclusive(' ') {
            let chunk = json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{"index": 0, "delta": {"content": piece}}]
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
            yield Ok::<_, Infallible>(Bytes::from(format!("data: {chunk}\n\n")));
        }
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    };
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(events))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [
            {"id": "Qwen/Qwen2.5-7B-Instruct", "object": "model"},
            {"id": "deepseek-ai/DeepSeek-R1", "object": "model"},
            {"id": "BAAI/bge-m3", "object": "model"}
        ]
    }))
}

async fn embeddings() -> Json<Value> {
    let vector: Vec<f64> = (0..8).map(|_| rand::thread_rng().r#gen::<f64>()).collect();
    Json(json!({"data": {"embedding": vector}, "usage": {"prompt_tokens": 4}}))
}

async fn rerank(body: Bytes) -> Json<Value> {
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let count = request
        .get("documents")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let results: Vec<Value> = (0..count)
        .map(|index| json!({"index": index, "relevance_score": 1.0 / (index as f64 + 1.0)}))
        .collect();
    Json(json!({"id": "rerank-mock", "results": results}))
}

async fn images() -> Json<Value> {
    Json(json!({"images": ["https://example.invalid/mock.png"], "seed": 42}))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/v1/user/info", get(user_info))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .route("/v1/images/generations", post(images));
    let bind_addr =
        std::env::var("MOCK_UPSTREAM_ADDR").unwrap_or_else(|_| "127.0.0.1:58088".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    println!("Mock upstream on http://{addr}");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
