use serde::Deserialize;
use serde_json::Value;

use crate::selection::LARGE_REQUEST_TOKENS;

/// 每条 chat 消息的固定开销。
pub const MESSAGE_OVERHEAD_TOKENS: usize = 100;

/// 请求类型，供选 key 策略使用。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Embedding,
    Completion,
    Streaming,
    LargeCompletion,
    Rerank,
    Image,
    Other,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Embedding => "embedding",
            RequestKind::Completion => "completion",
            RequestKind::Streaming => "streaming",
            RequestKind::LargeCompletion => "large_completion",
            RequestKind::Rerank => "rerank",
            RequestKind::Image => "image",
            RequestKind::Other => "other",
        }
    }
}

/// 按路径划分的接口族。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Completions,
    Embeddings,
    Rerank,
    ImageGenerations,
    Models,
    UserInfo,
    Other,
}

impl Endpoint {
    /// 子串匹配；`/chat` 且不含 `/completions` 视为 chat/completions。
    pub fn from_path(path: &str) -> Self {
        if path.contains("/chat/completions")
            || (path.starts_with("/chat") && !path.contains("/completions"))
        {
            Endpoint::ChatCompletions
        } else if path.contains("/completions") {
            Endpoint::Completions
        } else if path.contains("/embeddings") {
            Endpoint::Embeddings
        } else if path.contains("/rerank") {
            Endpoint::Rerank
        } else if path.contains("/images/generations") {
            Endpoint::ImageGenerations
        } else if path.contains("/models") {
            Endpoint::Models
        } else if path.contains("/user/info") {
            Endpoint::UserInfo
        } else {
            Endpoint::Other
        }
    }
}

/// 分类结果。
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub endpoint: Endpoint,
    pub kind: RequestKind,
    pub model: Option<String>,
    pub estimated_tokens: usize,
    pub stream: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RequestProbe {
    model: Option<Value>,
    stream: Option<Value>,
    messages: Option<Value>,
    prompt: Option<Value>,
    input: Option<Value>,
    query: Option<Value>,
    documents: Option<Value>,
}

impl RequestProbe {
    fn model(&self) -> Option<String> {
        self.model
            .as_ref()
            .and_then(Value::as_str)
            .filter(|model| !model.is_empty())
            .map(str::to_owned)
    }

    fn stream(&self) -> bool {
        matches!(self.stream, Some(Value::Bool(true)))
    }
}

/// 分类请求：路径决定接口族，请求体决定 model、stream 与估算 token 数。
/// 请求体无法解析时按空请求处理。
pub fn classify(path: &str, body: &[u8]) -> Classification {
    let endpoint = Endpoint::from_path(path);
    let probe: RequestProbe = serde_json::from_slice(body).unwrap_or_default();
    let stream = probe.stream();

    let (kind, estimated_tokens) = match endpoint {
        Endpoint::ChatCompletions => {
            let tokens = probe
                .messages
                .as_ref()
                .and_then(Value::as_array)
                .map(|messages| estimate_messages(messages))
                .unwrap_or(0);
            (completion_kind(stream), tokens)
        }
        Endpoint::Completions => {
            let tokens = probe.prompt.as_ref().map(estimate_value).unwrap_or(0);
            (completion_kind(stream), tokens)
        }
        Endpoint::Embeddings => {
            let tokens = probe.input.as_ref().map(estimate_value).unwrap_or(0);
            (RequestKind::Embedding, tokens)
        }
        Endpoint::Rerank => {
            let query = probe.query.as_ref().map(estimate_value).unwrap_or(0);
            let documents: usize = probe
                .documents
                .as_ref()
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(estimate_value)
                .sum();
            (RequestKind::Rerank, query + documents)
        }
        Endpoint::ImageGenerations => {
            let tokens = probe.prompt.as_ref().map(estimate_value).unwrap_or(0);
            (RequestKind::Image, tokens)
        }
        Endpoint::Models | Endpoint::UserInfo | Endpoint::Other => (RequestKind::Other, 0),
    };

    let kind = if estimated_tokens > LARGE_REQUEST_TOKENS {
        RequestKind::LargeCompletion
    } else {
        kind
    };

    Classification {
        endpoint,
        kind,
        model: probe.model(),
        estimated_tokens,
        stream,
    }
}

fn completion_kind(stream: bool) -> RequestKind {
    if stream {
        RequestKind::Streaming
    } else {
        RequestKind::Completion
    }
}

/// 每条消息 100 token 开销，再加上字符串内容的估算。
fn estimate_messages(messages: &[Value]) -> usize {
    messages
        .iter()
        .map(|message| {
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .map(estimate_tokens)
                .unwrap_or(0);
            MESSAGE_OVERHEAD_TOKENS + content
        })
        .sum()
}

fn estimate_value(value: &Value) -> usize {
    match value {
        Value::String(text) => estimate_tokens(text),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(estimate_tokens)
            .sum(),
        _ => 0,
    }
}

/// CJK 统一表意字符每个计 1，其余字符每 5 个计 1（向上取整）。
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), ch| {
        if ('\u{4E00}'..='\u{9FFF}').contains(&ch) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    cjk + other.div_ceil(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_mixed_text() {
        assert_eq!(estimate_tokens("你好world"), 3);
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdef"), 2);
        assert_eq!(estimate_tokens("中文字符"), 4);
    }

    #[test]
    fn chat_request_with_stream_is_streaming() {
        let body = br#"{"model":"Qwen/Qwen2.5-7B-Instruct","stream":true,
            "messages":[{"role":"user","content":"hello"}]}"#;
        let result = classify("/v1/chat/completions", body);
        assert_eq!(result.endpoint, Endpoint::ChatCompletions);
        assert_eq!(result.kind, RequestKind::Streaming);
        assert_eq!(result.model.as_deref(), Some("Qwen/Qwen2.5-7B-Instruct"));
        assert_eq!(result.estimated_tokens, 101);
        assert!(result.stream);
    }

    #[test]
    fn long_prompt_becomes_large_completion() {
        let prompt = "a".repeat(30_000);
        let body = serde_json::json!({ "prompt": prompt, "stream": true }).to_string();
        let result = classify("/v1/completions", body.as_bytes());
        assert_eq!(result.endpoint, Endpoint::Completions);
        assert_eq!(result.kind, RequestKind::LargeCompletion);
        assert_eq!(result.estimated_tokens, 6000);
    }

    #[test]
    fn many_messages_count_overhead() {
        let messages: Vec<Value> = (0..51)
            .map(|_| serde_json::json!({ "role": "user", "content": "" }))
            .collect();
        let body = serde_json::json!({ "messages": messages }).to_string();
        let result = classify("/chat/completions", body.as_bytes());
        assert_eq!(result.estimated_tokens, 5100);
        assert_eq!(result.kind, RequestKind::LargeCompletion);
    }

    #[test]
    fn embeddings_and_rerank_estimate_inputs() {
        let embed = classify("/v1/embeddings", br#"{"input":["hello","world"]}"#);
        assert_eq!(embed.kind, RequestKind::Embedding);
        assert_eq!(embed.estimated_tokens, 2);
        assert_eq!(embed.model, None);

        let rerank = classify(
            "/v1/rerank",
            "{\"query\":\"苹果\",\"documents\":[\"香蕉\",\"apple\"]}".as_bytes(),
        );
        assert_eq!(rerank.kind, RequestKind::Rerank);
        assert_eq!(rerank.estimated_tokens, 5);
    }

    #[test]
    fn invalid_body_is_tolerated() {
        let result = classify("/v1/chat/completions", b"not json");
        assert_eq!(result.kind, RequestKind::Completion);
        assert_eq!(result.estimated_tokens, 0);
        assert_eq!(result.model, None);
    }

    #[test]
    fn non_array_fields_keep_model_and_stream() {
        let chat = classify(
            "/v1/chat/completions",
            br#"{"model":"Qwen/QwQ-32B","stream":true,"messages":"hello"}"#,
        );
        assert_eq!(chat.model.as_deref(), Some("Qwen/QwQ-32B"));
        assert!(chat.stream);
        assert_eq!(chat.kind, RequestKind::Streaming);
        assert_eq!(chat.estimated_tokens, 0);

        let rerank = classify(
            "/v1/rerank",
            br#"{"model":"BAAI/bge-reranker-v2-m3","query":"hello","documents":"x"}"#,
        );
        assert_eq!(rerank.model.as_deref(), Some("BAAI/bge-reranker-v2-m3"));
        assert_eq!(rerank.estimated_tokens, 1);
    }

    #[test]
    fn bare_chat_path_maps_to_chat_completions() {
        assert_eq!(Endpoint::from_path("/chat"), Endpoint::ChatCompletions);
        assert_eq!(Endpoint::from_path("/v1/models"), Endpoint::Models);
        assert_eq!(Endpoint::from_path("/v1/user/info"), Endpoint::UserInfo);
        assert_eq!(Endpoint::from_path("/v1/audio/speech"), Endpoint::Other);
        assert_eq!(
            Endpoint::from_path("/v1/images/generations"),
            Endpoint::ImageGenerations
        );
    }
}
