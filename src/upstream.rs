use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, header::AUTHORIZATION};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{error::ProbeError, error::ProxyError, keys::mask_key};

/// 余额查询与测试调用的超时时间。
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// 账户接口返回成功时的业务码。
pub const BALANCE_OK_CODE: i64 = 20000;
/// 恢复探测使用的测试模型。
pub const PROBE_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

const PROBE_PROMPT: &str = "你好，这是一个测试";

/// upstream 基础地址，负责拼接各接口的 URL。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    base: Url,
}

impl UpstreamEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ProxyError> {
        let base = Url::parse(endpoint).map_err(|source| ProxyError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            source,
        })?;
        Ok(Self { base })
    }

    /// 在基础路径后追加 `path`，保留查询串。
    pub fn url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{path}"));
        url.set_query(query.filter(|query| !query.is_empty()));
        url
    }

    /// OpenAI 兼容接口：`{base}/v1{path}`。
    pub fn v1(&self, path: &str, query: Option<&str>) -> Url {
        self.url(&format!("/v1{path}"), query)
    }

    pub fn as_str(&self) -> &str {
        self.base.as_str()
    }
}

/// 健康检查依赖的 upstream 能力。
#[async_trait]
pub trait UpstreamProbe: Send + Sync {
    async fn check_balance(&self, key: &str) -> Result<f64, ProbeError>;
    async fn test_completion(&self, key: &str) -> Result<(), ProbeError>;
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: bool,
    #[serde(default)]
    data: Option<UserInfoData>,
}

#[derive(Debug, Deserialize)]
struct UserInfoData {
    #[serde(rename = "totalBalance")]
    total_balance: Option<Value>,
}

/// 解析 `/v1/user/info` 响应中的总余额。余额可能是字符串或数字。
pub fn parse_balance(body: &[u8]) -> Result<f64, ProbeError> {
    let info: UserInfoResponse = serde_json::from_slice(body)?;
    if !info.status || info.code != BALANCE_OK_CODE {
        return Err(ProbeError::Rejected {
            code: info.code,
            message: info.message,
        });
    }

    let raw = info.data.and_then(|data| data.total_balance);
    match raw {
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| ProbeError::InvalidBalance(text)),
        Some(Value::Number(number)) => number
            .as_f64()
            .ok_or_else(|| ProbeError::InvalidBalance(number.to_string())),
        Some(other) => Err(ProbeError::InvalidBalance(other.to_string())),
        None => Err(ProbeError::InvalidBalance(String::new())),
    }
}

/// 基于 reqwest 的探测实现。
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    endpoint: UpstreamEndpoint,
}

impl HttpProbe {
    pub fn new(client: Client, endpoint: UpstreamEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl UpstreamProbe for HttpProbe {
    async fn check_balance(&self, key: &str) -> Result<f64, ProbeError> {
        let response = self
            .client
            .get(self.endpoint.v1("/user/info", None))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if status != StatusCode::OK {
            return Err(ProbeError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let balance = parse_balance(&body)?;
        debug!(key = %mask_key(key), balance, "balance checked");
        Ok(balance)
    }

    async fn test_completion(&self, key: &str) -> Result<(), ProbeError> {
        let payload = json!({
            "model": PROBE_MODEL,
            "messages": [{ "role": "user", "content": PROBE_PROMPT }],
            "max_tokens": 512,
        });

        let response = self
            .client
            .post(self.endpoint.v1("/chat/completions", None))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .json(&payload)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if status != StatusCode::OK {
            return Err(ProbeError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let value: Value = serde_json::from_slice(&body)?;
        match value.get("choices").and_then(Value::as_array) {
            Some(choices) if !choices.is_empty() => Ok(()),
            _ => Err(ProbeError::MissingChoices),
        }
    }
}
