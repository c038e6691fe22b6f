//! 各接口族的请求体类型，以及发往 upstream 之前的默认值与校验。

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{classify::Endpoint, config::RequestDefaults, error::PayloadError, models::ModelType};

pub const DEFAULT_CHAT_MODEL: &str = "GLM-4";
pub const DEFAULT_RERANK_MODEL: &str = "BAAI/bge-reranker-v2-m3";
pub const DEFAULT_IMAGE_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const DEFAULT_EMBEDDING_MODEL: &str = "BAAI/bge-m3";

/// 推理模型的 max_tokens 下限，低于它时改写为默认值。
pub const REASONING_MIN_MAX_TOKENS: f64 = 1000.0;
/// 推理模型请求附带的 upstream 超时（秒）。
pub const REASONING_TIMEOUT_SECS: u64 = 3600;

const DEFAULT_RERANK_TOP_N: u64 = 10;
const DEFAULT_IMAGE_COUNT: u64 = 1;
const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// 只接受字符串，其它类型视为缺失。
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        _ => None,
    })
}

/// 名称同时包含 deepseek 与 r1（忽略大小写）的模型按推理模型处理。
pub fn is_reasoning_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.contains("deepseek") && lower.contains("r1")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<Value>,
    /// upstream 图片接口不支持流式输出，序列化时丢弃。
    #[serde(default, skip_serializing)]
    pub stream: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
}

/// embeddings 发往 upstream 时只保留 model 与 input。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingUpstreamRequest {
    pub model: String,
    pub input: Vec<Value>,
}

/// 解码后的请求体。
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Chat(ChatCompletionRequest),
    Completion(CompletionRequest),
    Rerank(RerankRequest),
    Image(ImageGenerationRequest),
    Embedding(EmbeddingRequest),
}

/// 转换后的请求体及代理需要的元信息。
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub body: Bytes,
    pub model: Option<String>,
    pub stream: bool,
    pub reasoning: bool,
}

impl PreparedRequest {
    fn passthrough(body: Bytes) -> Self {
        Self {
            body,
            model: None,
            stream: false,
            reasoning: false,
        }
    }
}

impl RequestPayload {
    /// 按接口族解码；不需要改写的接口返回 None。
    pub fn decode(endpoint: Endpoint, body: &[u8]) -> Result<Option<Self>, PayloadError> {
        let value: Value = serde_json::from_slice(body).map_err(PayloadError::InvalidJson)?;
        if !value.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        let payload = match endpoint {
            Endpoint::ChatCompletions => Self::Chat(from_value(value)?),
            Endpoint::Completions => Self::Completion(from_value(value)?),
            Endpoint::Rerank => Self::Rerank(from_value(value)?),
            Endpoint::ImageGenerations => Self::Image(from_value(value)?),
            Endpoint::Embeddings => Self::Embedding(from_value(value)?),
            Endpoint::Models | Endpoint::UserInfo | Endpoint::Other => return Ok(None),
        };
        Ok(Some(payload))
    }
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, PayloadError> {
    serde_json::from_value(value).map_err(PayloadError::InvalidJson)
}

/// 推理模型：补齐 max_tokens、强制流式并延长超时。
fn apply_reasoning_defaults(
    max_tokens: &mut Option<Value>,
    stream: &mut Option<Value>,
    timeout: &mut Option<Value>,
    defaults: &RequestDefaults,
) {
    let too_small = match max_tokens.as_ref() {
        None => true,
        Some(value) => value
            .as_f64()
            .is_some_and(|tokens| tokens < REASONING_MIN_MAX_TOKENS),
    };
    if too_small {
        *max_tokens = Some(Value::from(defaults.max_tokens));
    }
    *stream = Some(Value::Bool(true));
    *timeout = Some(Value::from(REASONING_TIMEOUT_SECS));
}

fn is_true(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, PayloadError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(PayloadError::InvalidJson)
}

/// 对请求体做接口族相关的默认值补齐与必填校验。
/// 空请求体以及无需改写的接口原样返回。
/// `registered` 为模型登记表中该模型的类别，登记为推理模型时与名称匹配同等对待。
pub fn prepare_request(
    endpoint: Endpoint,
    body: Bytes,
    defaults: &RequestDefaults,
    registered: Option<ModelType>,
) -> Result<PreparedRequest, PayloadError> {
    let registered_reasoning = registered == Some(ModelType::Reasoning);
    if body.is_empty() {
        return Ok(PreparedRequest::passthrough(body));
    }
    let Some(payload) = RequestPayload::decode(endpoint, &body)? else {
        return Ok(PreparedRequest::passthrough(body));
    };

    match payload {
        RequestPayload::Chat(mut request) => {
            if request.messages.as_ref().is_none_or(Value::is_null) {
                return Err(PayloadError::MissingField { field: "messages" });
            }
            let model = request
                .model
                .get_or_insert_with(|| DEFAULT_CHAT_MODEL.to_string())
                .clone();
            let reasoning = registered_reasoning || is_reasoning_model(&model);
            if reasoning {
                debug!(model, "applying reasoning model defaults");
                apply_reasoning_defaults(
                    &mut request.max_tokens,
                    &mut request.stream,
                    &mut request.timeout,
                    defaults,
                );
            }
            Ok(PreparedRequest {
                body: encode(&request)?,
                stream: is_true(request.stream.as_ref()),
                model: Some(model),
                reasoning,
            })
        }
        RequestPayload::Completion(mut request) => {
            if request.prompt.as_ref().is_none_or(Value::is_null) {
                return Err(PayloadError::MissingField { field: "prompt" });
            }
            let model = request
                .model
                .get_or_insert_with(|| DEFAULT_CHAT_MODEL.to_string())
                .clone();
            let reasoning = registered_reasoning || is_reasoning_model(&model);
            if reasoning {
                apply_reasoning_defaults(
                    &mut request.max_tokens,
                    &mut request.stream,
                    &mut request.timeout,
                    defaults,
                );
            }
            Ok(PreparedRequest {
                body: encode(&request)?,
                stream: is_true(request.stream.as_ref()),
                model: Some(model),
                reasoning,
            })
        }
        RequestPayload::Rerank(mut request) => {
            if request.query.as_ref().is_none_or(Value::is_null) {
                return Err(PayloadError::MissingField { field: "query" });
            }
            if request.documents.as_ref().is_none_or(Value::is_null) {
                return Err(PayloadError::MissingField { field: "documents" });
            }
            let model = request
                .model
                .get_or_insert_with(|| DEFAULT_RERANK_MODEL.to_string())
                .clone();
            request
                .top_n
                .get_or_insert_with(|| Value::from(DEFAULT_RERANK_TOP_N));
            request
                .return_documents
                .get_or_insert(Value::Bool(true));
            Ok(PreparedRequest {
                body: encode(&request)?,
                model: Some(model),
                stream: false,
                reasoning: false,
            })
        }
        RequestPayload::Image(mut request) => {
            if request.prompt.as_ref().is_none_or(Value::is_null) {
                return Err(PayloadError::MissingField { field: "prompt" });
            }
            let model = request
                .model
                .get_or_insert_with(|| DEFAULT_IMAGE_MODEL.to_string())
                .clone();
            request.n.get_or_insert_with(|| Value::from(DEFAULT_IMAGE_COUNT));
            request
                .size
                .get_or_insert_with(|| Value::from(defaults.image_size.clone()));
            request
                .guidance_scale
                .get_or_insert_with(|| Value::from(DEFAULT_GUIDANCE_SCALE));
            request.stream = None;
            Ok(PreparedRequest {
                body: encode(&request)?,
                model: Some(model),
                stream: false,
                reasoning: false,
            })
        }
        RequestPayload::Embedding(request) => {
            let input = match request.input {
                None | Some(Value::Null) => {
                    return Err(PayloadError::MissingField { field: "input" });
                }
                Some(Value::Array(items)) => items,
                Some(single) => vec![single],
            };
            let model = request
                .model
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());
            let upstream = EmbeddingUpstreamRequest {
                model: model.clone(),
                input,
            };
            Ok(PreparedRequest {
                body: encode(&upstream)?,
                model: Some(model),
                stream: false,
                reasoning: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn prepare(endpoint: Endpoint, body: Value) -> Result<(PreparedRequest, Value), PayloadError> {
        let prepared = prepare_request(
            endpoint,
            Bytes::from(body.to_string()),
            &RequestDefaults::default(),
            None,
        )?;
        let value = serde_json::from_slice(&prepared.body).unwrap();
        Ok((prepared, value))
    }

    #[test]
    fn reasoning_chat_forces_stream_and_max_tokens() {
        let (prepared, body) = prepare(
            Endpoint::ChatCompletions,
            json!({
                "model": "deepseek-ai/deepseek-r1",
                "messages": [{"role": "user", "content": "hi"}],
                "temperature": 0.6
            }),
        )
        .unwrap();
        assert!(prepared.reasoning);
        assert!(prepared.stream);
        assert_eq!(body["max_tokens"], 16000);
        assert_eq!(body["stream"], true);
        assert_eq!(body["timeout"], 3600);
        assert_eq!(body["temperature"], 0.6);
    }

    #[test]
    fn reasoning_keeps_reasonable_max_tokens() {
        let (_, body) = prepare(
            Endpoint::ChatCompletions,
            json!({
                "model": "deepseek-ai/DeepSeek-R1",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 4096,
                "stream": false
            }),
        )
        .unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], true);

        let (_, body) = prepare(
            Endpoint::ChatCompletions,
            json!({
                "model": "deepseek-ai/DeepSeek-R1",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 200
            }),
        )
        .unwrap();
        assert_eq!(body["max_tokens"], 16000);
    }

    #[test]
    fn chat_defaults_model_and_requires_messages() {
        let (prepared, body) = prepare(
            Endpoint::ChatCompletions,
            json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .unwrap();
        assert_eq!(body["model"], DEFAULT_CHAT_MODEL);
        assert!(!prepared.stream);
        assert!(body.get("max_tokens").is_none());

        assert!(matches!(
            prepare(Endpoint::ChatCompletions, json!({"model": "x"})).unwrap_err(),
            PayloadError::MissingField { field: "messages" }
        ));

        let (_, body) = prepare(Endpoint::ChatCompletions, json!({"messages": []})).unwrap();
        assert_eq!(body["messages"], json!([]));
    }

    #[test]
    fn rerank_requires_query_and_documents() {
        let err = prepare(Endpoint::Rerank, json!({"documents": ["a"]})).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField { field: "query" }));
        let err = prepare(Endpoint::Rerank, json!({"query": "q"})).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField { field: "documents" }));

        let (_, body) = prepare(
            Endpoint::Rerank,
            json!({"query": "q", "documents": ["a", "b"], "top_n": 1}),
        )
        .unwrap();
        assert_eq!(body["model"], DEFAULT_RERANK_MODEL);
        assert_eq!(body["top_n"], 1);
        assert_eq!(body["return_documents"], true);
    }

    #[test]
    fn image_defaults_and_drops_stream() {
        assert!(prepare(Endpoint::ImageGenerations, json!({"n": 2})).is_err());

        let (_, body) = prepare(
            Endpoint::ImageGenerations,
            json!({"prompt": "a cat", "stream": true}),
        )
        .unwrap();
        assert_eq!(body["model"], DEFAULT_IMAGE_MODEL);
        assert_eq!(body["n"], 1);
        assert_eq!(body["size"], "1024x1024");
        assert_eq!(body["guidance_scale"], 7.5);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn embeddings_wrap_scalar_input_and_strip_extras() {
        let (_, body) = prepare(
            Endpoint::Embeddings,
            json!({"input": "hello", "encoding_format": "float", "user": "u"}),
        )
        .unwrap();
        assert_eq!(body, json!({"model": DEFAULT_EMBEDDING_MODEL, "input": ["hello"]}));

        let err = prepare(Endpoint::Embeddings, json!({"model": "m"})).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField { field: "input" }));
    }

    #[test]
    fn invalid_and_non_object_bodies_are_rejected() {
        let defaults = RequestDefaults::default();
        let err = prepare_request(Endpoint::ChatCompletions, Bytes::from_static(b"{"), &defaults, None)
            .unwrap_err();
        assert!(matches!(err, PayloadError::InvalidJson(_)));

        let err = prepare_request(Endpoint::Rerank, Bytes::from_static(b"[1]"), &defaults, None)
            .unwrap_err();
        assert!(matches!(err, PayloadError::NotAnObject));
    }

    #[test]
    fn empty_body_and_other_endpoints_pass_through() {
        let defaults = RequestDefaults::default();
        let prepared =
            prepare_request(Endpoint::ChatCompletions, Bytes::new(), &defaults, None).unwrap();
        assert!(prepared.body.is_empty());

        let raw = Bytes::from_static(br#"{"voice":"alloy"}"#);
        let prepared = prepare_request(Endpoint::Other, raw.clone(), &defaults, None).unwrap();
        assert_eq!(prepared.body, raw);
    }

    #[test]
    fn non_string_model_falls_back_to_default() {
        let (_, body) = prepare(
            Endpoint::Completions,
            json!({"model": 42, "prompt": "once upon"}),
        )
        .unwrap();
        assert_eq!(body["model"], DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn registered_reasoning_models_get_reasoning_defaults() {
        let body = json!({
            "model": "Qwen/QwQ-32B",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let (prepared, sent) = prepare(Endpoint::ChatCompletions, body.clone()).unwrap();
        assert!(!prepared.reasoning);
        assert!(sent.get("max_tokens").is_none());

        let prepared = prepare_request(
            Endpoint::ChatCompletions,
            Bytes::from(body.to_string()),
            &RequestDefaults::default(),
            Some(ModelType::Reasoning),
        )
        .unwrap();
        let sent: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert!(prepared.reasoning);
        assert!(prepared.stream);
        assert_eq!(sent["max_tokens"], 16000);
        assert_eq!(sent["stream"], true);

        let prepared = prepare_request(
            Endpoint::ChatCompletions,
            Bytes::from(body.to_string()),
            &RequestDefaults::default(),
            Some(ModelType::Chat),
        )
        .unwrap();
        assert!(!prepared.reasoning);
    }
}
