use reqwest::StatusCode;
use thiserror::Error;

/// 请求体在发往 upstream 之前的结构错误。
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("request body is empty or invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("{field} field is required")]
    MissingField { field: &'static str },
}

/// 余额查询与测试调用的失败原因。
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("upstream rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("unparseable balance '{0}'")]
    InvalidBalance(String),
    #[error("response carried no choices")]
    MissingChoices,
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no eligible API key: {0}")]
    NoEligibleKey(String),
    #[error("API key {0} not found")]
    KeyNotFound(String),
    #[error("balance {balance} is below the minimum threshold {threshold}")]
    BalanceBelowThreshold { balance: f64, threshold: f64 },
    #[error("balance {0} is not positive")]
    NonPositiveBalance(f64),
    #[error("invalid key mode: {0}")]
    InvalidKeyMode(String),
    #[error("model {0} is disabled")]
    ModelDisabled(String),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),
    #[error("settings error: {0}")]
    Settings(#[source] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(reqwest::Error),
}

impl ProxyError {
    /// 面向客户端的 HTTP 状态码。
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::ModelDisabled(_) => StatusCode::FORBIDDEN,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Payload(PayloadError::InvalidJson(_))
            | ProxyError::Payload(PayloadError::NotAnObject) => StatusCode::BAD_REQUEST,
            ProxyError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::BalanceBelowThreshold { .. }
            | ProxyError::NonPositiveBalance(_)
            | ProxyError::InvalidKeyMode(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI 风格错误里的 `type` 字段。
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::ModelDisabled(_) | ProxyError::Payload(_) => "invalid_request_error",
            ProxyError::NoEligibleKey(_) => "no_available_key",
            ProxyError::Unauthorized(_) => "unauthorized",
            ProxyError::Http(_) => "upstream_error",
            _ => "server_error",
        }
    }

    /// 是否属于选 key 失败，便于调用方区分。
    pub fn is_no_eligible_key(&self) -> bool {
        matches!(self, ProxyError::NoEligibleKey(_))
    }
}
