//! upstream 响应到 OpenAI 兼容格式的转换。所有函数都是全函数：
//! 无法识别或解析失败时原样返回输入。

use bytes::Bytes;
use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::payload::{DEFAULT_CHAT_MODEL, is_reasoning_model};

/// 响应中缺少模型名时，embedding 列表使用的名称。
pub const EMBEDDING_RESPONSE_MODEL: &str = "embedding-2";
const EMBEDDING_FALLBACK_TOTAL_TOKENS: u64 = 100;

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'a Value,
}

#[derive(Debug, Serialize)]
struct EmbeddingList<'a> {
    object: &'static str,
    data: [EmbeddingItem<'a>; 1],
    model: &'static str,
    usage: EmbeddingUsage,
}

#[derive(Debug, Serialize)]
struct EmbeddingItem<'a> {
    object: &'static str,
    embedding: &'a Value,
    index: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingUsage {
    prompt_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ImageResponse {
    images: Vec<Value>,
    timings: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<Value>,
}

/// 识别出的响应形态。
#[derive(Debug)]
enum ResponseShape<'a> {
    Chat,
    UpstreamError,
    Rerank,
    Images(&'a Vec<Value>),
    EmbeddingObject(&'a Value),
    EmbeddingTopLevel(&'a Value),
    EmbeddingResult(&'a Value),
    EmbeddingList,
    Unknown,
}

fn detect(value: &Map<String, Value>) -> ResponseShape<'_> {
    let has_choices = value
        .get("choices")
        .and_then(Value::as_array)
        .is_some_and(|choices| !choices.is_empty());
    if has_choices && value.get("model").is_some_and(Value::is_string) {
        return ResponseShape::Chat;
    }
    if value.contains_key("code") {
        return ResponseShape::UpstreamError;
    }
    if let Some(first) = value
        .get("results")
        .and_then(Value::as_array)
        .and_then(|results| results.first())
        && first.get("index").is_some()
        && first.get("relevance_score").is_some()
    {
        return ResponseShape::Rerank;
    }
    if let Some(images) = value.get("images").and_then(Value::as_array) {
        return ResponseShape::Images(images);
    }
    match value.get("data") {
        Some(Value::Object(data)) => {
            if let Some(embedding) = data.get("embedding") {
                return ResponseShape::EmbeddingObject(embedding);
            }
        }
        Some(Value::Array(items)) => {
            if items
                .first()
                .is_some_and(|item| item.get("embedding").is_some())
            {
                return ResponseShape::EmbeddingList;
            }
        }
        _ => {}
    }
    if let Some(embedding) = value.get("embedding") {
        return ResponseShape::EmbeddingTopLevel(embedding);
    }
    if let Some(embedding) = value.get("result").and_then(|result| result.get("embedding")) {
        return ResponseShape::EmbeddingResult(embedding);
    }
    ResponseShape::Unknown
}

/// 非流式响应转换。已符合 OpenAI 格式的响应原样返回，因此转换是幂等的。
pub fn transform_response(body: &Bytes) -> Bytes {
    if body.is_empty() {
        return body.clone();
    }
    let Ok(Value::Object(value)) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };

    let rendered = match detect(&value) {
        ResponseShape::Chat => normalize_chat_usage(value.clone()).map(|fixed| encode(&fixed)),
        ResponseShape::UpstreamError => {
            let message = value.get("message").and_then(Value::as_str).unwrap_or("");
            let code = value.get("code").unwrap_or(&Value::Null);
            Some(encode(&ErrorEnvelope {
                error: ErrorBody {
                    message,
                    kind: "invalid_request_error",
                    code,
                },
            }))
        }
        ResponseShape::Images(images) => {
            normalize_images(&value, images).map(|fixed| encode(&fixed))
        }
        ResponseShape::EmbeddingObject(embedding) => {
            let usage = value.get("usage");
            let prompt_tokens = usage
                .and_then(|usage| usage.get("prompt_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let total_tokens = usage
                .and_then(|usage| usage.get("total_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(prompt_tokens);
            let total_tokens = if total_tokens == 0 {
                EMBEDDING_FALLBACK_TOTAL_TOKENS
            } else {
                total_tokens
            };
            Some(encode(&embedding_list(embedding, prompt_tokens, total_tokens)))
        }
        ResponseShape::EmbeddingTopLevel(embedding) | ResponseShape::EmbeddingResult(embedding) => {
            Some(encode(&embedding_list(embedding, 0, 0)))
        }
        ResponseShape::Rerank | ResponseShape::EmbeddingList | ResponseShape::Unknown => None,
    };

    rendered.flatten().unwrap_or_else(|| body.clone())
}

fn encode<T: Serialize>(value: &T) -> Option<Bytes> {
    serde_json::to_vec(value).ok().map(Bytes::from)
}

/// 补齐 usage：缺失时置零，缺 total_tokens 时求和。无需修改时返回 None。
fn normalize_chat_usage(mut value: Map<String, Value>) -> Option<Value> {
    match value.get_mut("usage") {
        Some(Value::Object(usage)) => {
            if usage.get("total_tokens").is_some_and(Value::is_number) {
                return None;
            }
            let prompt = usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if prompt == 0 && completion == 0 {
                return None;
            }
            usage.insert("total_tokens".into(), Value::from(prompt + completion));
        }
        Some(_) => return None,
        None => {
            value.insert(
                "usage".into(),
                json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 }),
            );
        }
    }
    Some(Value::Object(value))
}

fn normalize_images(value: &Map<String, Value>, images: &[Value]) -> Option<ImageResponse> {
    if images
        .first()
        .is_some_and(|first| first.get("url").is_some())
    {
        return None;
    }

    let images = images
        .iter()
        .filter_map(|image| match image {
            Value::String(url) => Some(json!({ "url": url })),
            Value::Object(object) if object.contains_key("url") => Some(image.clone()),
            Value::Object(object) => object.get("image").map(|url| {
                let mut fixed = object.clone();
                fixed.remove("image");
                fixed.insert("url".into(), url.clone());
                Value::Object(fixed)
            }),
            _ => None,
        })
        .collect();

    Some(ImageResponse {
        images,
        timings: value
            .get("timings")
            .cloned()
            .unwrap_or_else(|| json!({ "inference": 0 })),
        seed: value.get("seed").cloned(),
    })
}

fn embedding_list(embedding: &Value, prompt_tokens: u64, total_tokens: u64) -> EmbeddingList<'_> {
    EmbeddingList {
        object: "list",
        data: [EmbeddingItem {
            object: "embedding",
            embedding,
            index: 0,
        }],
        model: EMBEDDING_RESPONSE_MODEL,
        usage: EmbeddingUsage {
            prompt_tokens,
            total_tokens,
        },
    }
}

/// 单个 SSE `data:` 负载的转换。`[DONE]` 与无法解析的内容原样返回。
/// `reasoning` 为真时无论事件里的模型名如何都按推理模型修正。
pub fn transform_stream_event(data: &str, reasoning: bool) -> String {
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return data.to_string();
    }
    let Ok(Value::Object(mut event)) = serde_json::from_str::<Value>(trimmed) else {
        return data.to_string();
    };

    if event.contains_key("choices") {
        let reasoning = reasoning
            || event
                .get("model")
                .and_then(Value::as_str)
                .is_some_and(is_reasoning_model);
        if !reasoning {
            return data.to_string();
        }
        let Some(choice) = event
            .get_mut("choices")
            .and_then(Value::as_array_mut)
            .and_then(|choices| choices.first_mut())
            .and_then(Value::as_object_mut)
        else {
            return data.to_string();
        };

        let mut changed = false;
        if let Some(delta) = choice.get_mut("delta").and_then(Value::as_object_mut)
            && !delta.contains_key("content")
        {
            delta.insert("content".into(), Value::String(String::new()));
            changed = true;
        }
        if !choice.contains_key("finish_reason") {
            choice.insert("finish_reason".into(), Value::Null);
            changed = true;
        }
        if !changed {
            return data.to_string();
        }
        return serde_json::to_string(&event).unwrap_or_else(|_| data.to_string());
    }

    // 没有 choices 的事件一律包成 chunk；无文本时 delta 为空对象。
    let mut delta = Map::new();
    if let Some(content) = event
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| event.get("text").and_then(Value::as_str))
    {
        delta.insert("content".into(), Value::String(content.to_string()));
    }

    let now = Local::now();
    let finish_reason = event
        .get("finish_reason")
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty())
        .map(|reason| Value::String(reason.to_string()))
        .unwrap_or(Value::Null);
    let mut chunk = json!({
        "id": format!("chatcmpl-{}", now.format("%Y%m%d%H%M%S")),
        "object": "chat.completion.chunk",
        "created": now.timestamp(),
        "model": DEFAULT_CHAT_MODEL,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = event.remove("usage").filter(Value::is_object) {
        chunk["usage"] = usage;
    }
    serde_json::to_string(&chunk).unwrap_or_else(|_| data.to_string())
}

/// 流式事件中第一个 choice 的增量文本。
pub fn delta_content(event: &Value) -> Option<&str> {
    let choice = event.get("choices")?.as_array()?.first()?;
    choice
        .get("delta")
        .and_then(|delta| delta.get("content"))
        .or_else(|| choice.get("text"))
        .and_then(Value::as_str)
}

/// 响应或事件里的 usage.total_tokens。
pub fn usage_total_tokens(value: &Value) -> Option<u64> {
    value.get("usage")?.get("total_tokens")?.as_u64()
}
