use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// SiliconFlow 兼容后端默认地址。
pub const DEFAULT_UPSTREAM: &str = "https://api.siliconflow.cn";

const DEFAULT_BALANCE_WEIGHT: f64 = 0.4;
const DEFAULT_SUCCESS_RATE_WEIGHT: f64 = 0.3;
const DEFAULT_RPM_WEIGHT: f64 = 0.15;
const DEFAULT_TPM_WEIGHT: f64 = 0.15;

const MIN_AUTO_UPDATE_SECS: u64 = 60;

/// 运行期可调参数，持久化在 settings 表中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolSettings,
    pub proxy: ProxySettings,
    pub defaults: RequestDefaults,
    pub security: SecuritySettings,
}

/// key 池相关参数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_balance_threshold: f64,
    pub max_balance_display: f64,
    pub max_stats_entries: usize,
    /// 分钟
    pub recovery_interval: u64,
    pub max_consecutive_failures: u32,
    pub balance_weight: f64,
    pub success_rate_weight: f64,
    pub rpm_weight: f64,
    pub tpm_weight: f64,
    /// 秒
    pub auto_update_interval: u64,
    pub auto_delete_zero_balance_keys: bool,
    /// 分钟
    pub refresh_used_keys_interval: u64,
    pub model_key_strategies: HashMap<String, u8>,
    pub disabled_models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// 秒
    pub stream_timeout: u64,
    /// 秒
    pub standard_timeout: u64,
    /// 秒
    pub heartbeat_interval: u64,
    pub buffer_threshold: usize,
    /// 毫秒
    pub min_flush_delay: u64,
    /// 毫秒
    pub max_flush_delay: u64,
    pub max_concurrency: usize,
    pub fake_streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub max_tokens: u64,
    pub image_size: String,
}

/// 代理接口的客户端鉴权。关闭时所有请求直接放行。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub api_key_enabled: bool,
    pub api_key: String,
}

impl SecuritySettings {
    /// 开启鉴权时校验客户端提供的 key。
    pub fn check(&self, presented: Option<&str>) -> Result<(), ClientKeyRejection> {
        if !self.api_key_enabled {
            return Ok(());
        }
        match presented {
            None | Some("") => Err(ClientKeyRejection::Missing),
            Some(key) if key == self.api_key => Ok(()),
            Some(_) => Err(ClientKeyRejection::Invalid),
        }
    }
}

/// 客户端 key 被拒绝的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKeyRejection {
    Missing,
    Invalid,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_balance_threshold: 0.8,
            max_balance_display: 14.0,
            max_stats_entries: 60,
            recovery_interval: 10,
            max_consecutive_failures: 5,
            balance_weight: DEFAULT_BALANCE_WEIGHT,
            success_rate_weight: DEFAULT_SUCCESS_RATE_WEIGHT,
            rpm_weight: DEFAULT_RPM_WEIGHT,
            tpm_weight: DEFAULT_TPM_WEIGHT,
            auto_update_interval: 600,
            auto_delete_zero_balance_keys: true,
            refresh_used_keys_interval: 60,
            model_key_strategies: HashMap::new(),
            disabled_models: Vec::new(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            stream_timeout: 600,
            standard_timeout: 600,
            heartbeat_interval: 10,
            buffer_threshold: 1024,
            min_flush_delay: 10,
            max_flush_delay: 50,
            max_concurrency: 50,
            fake_streaming: false,
        }
    }
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 16000,
            image_size: "1024x1024".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            proxy: ProxySettings::default(),
            defaults: RequestDefaults::default(),
            security: SecuritySettings::default(),
        }
    }
}

impl Settings {
    /// 修正非法取值：非正权重回落到默认值，间隔设下限。
    pub fn sanitized(mut self) -> Self {
        let pool = &mut self.pool;
        if pool.balance_weight <= 0.0 {
            pool.balance_weight = DEFAULT_BALANCE_WEIGHT;
        }
        if pool.success_rate_weight <= 0.0 {
            pool.success_rate_weight = DEFAULT_SUCCESS_RATE_WEIGHT;
        }
        if pool.rpm_weight <= 0.0 {
            pool.rpm_weight = DEFAULT_RPM_WEIGHT;
        }
        if pool.tpm_weight <= 0.0 {
            pool.tpm_weight = DEFAULT_TPM_WEIGHT;
        }
        if pool.max_balance_display <= 0.0 {
            pool.max_balance_display = 14.0;
        }
        pool.auto_update_interval = pool.auto_update_interval.max(MIN_AUTO_UPDATE_SECS);
        pool.recovery_interval = pool.recovery_interval.max(1);
        pool.refresh_used_keys_interval = pool.refresh_used_keys_interval.max(1);
        pool.max_stats_entries = pool.max_stats_entries.max(1);
        pool.max_consecutive_failures = pool.max_consecutive_failures.max(1);

        let proxy = &mut self.proxy;
        proxy.heartbeat_interval = proxy.heartbeat_interval.max(1);
        proxy.max_concurrency = proxy.max_concurrency.max(1);
        proxy.min_flush_delay = proxy.min_flush_delay.max(1);
        if proxy.max_flush_delay < proxy.min_flush_delay {
            proxy.max_flush_delay = proxy.min_flush_delay;
        }

        self.security.api_key = self.security.api_key.trim().to_string();
        self
    }

    pub fn auto_update_period(&self) -> Duration {
        Duration::from_secs(self.pool.auto_update_interval.max(MIN_AUTO_UPDATE_SECS))
    }

    pub fn recovery_period(&self) -> Duration {
        Duration::from_secs(self.pool.recovery_interval.max(1) * 60)
    }

    pub fn used_keys_period(&self) -> Duration {
        Duration::from_secs(self.pool.refresh_used_keys_interval.max(1) * 60)
    }

    pub fn is_model_disabled(&self, model: &str) -> bool {
        self.pool
            .disabled_models
            .iter()
            .any(|disabled| disabled == model)
    }
}

/// 进程内共享的 Settings 句柄。
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings.sanitized())),
        }
    }

    pub async fn snapshot(&self) -> Settings {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, settings: Settings) -> Settings {
        let sanitized = settings.sanitized();
        *self.inner.write().await = sanitized.clone();
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_restores_default_weights_and_floors_intervals() {
        let mut settings = Settings::default();
        settings.pool.balance_weight = 0.0;
        settings.pool.rpm_weight = -1.0;
        settings.pool.auto_update_interval = 5;
        settings.proxy.max_flush_delay = 0;

        let sanitized = settings.sanitized();
        assert_eq!(sanitized.pool.balance_weight, 0.4);
        assert_eq!(sanitized.pool.rpm_weight, 0.15);
        assert_eq!(sanitized.pool.auto_update_interval, 60);
        assert_eq!(sanitized.proxy.max_flush_delay, sanitized.proxy.min_flush_delay);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"pool":{"min_balance_threshold":2.5}}"#).unwrap();
        assert_eq!(settings.pool.min_balance_threshold, 2.5);
        assert_eq!(settings.pool.max_balance_display, 14.0);
        assert_eq!(settings.proxy.buffer_threshold, 1024);
        assert_eq!(settings.defaults.max_tokens, 16000);
    }

    #[test]
    fn client_key_check_only_applies_when_enabled() {
        let mut security = SecuritySettings::default();
        assert_eq!(security.check(None), Ok(()));

        security.api_key_enabled = true;
        security.api_key = "gw-secret".into();
        assert_eq!(security.check(None), Err(ClientKeyRejection::Missing));
        assert_eq!(security.check(Some("")), Err(ClientKeyRejection::Missing));
        assert_eq!(security.check(Some("nope")), Err(ClientKeyRejection::Invalid));
        assert_eq!(security.check(Some("gw-secret")), Ok(()));
    }

    #[test]
    fn sanitize_trims_client_key() {
        let mut settings = Settings::default();
        settings.security.api_key = "  gw-secret \n".into();
        assert_eq!(settings.sanitized().security.api_key, "gw-secret");
    }

    #[tokio::test]
    async fn handle_replace_sanitizes() {
        let handle = SettingsHandle::default();
        let mut settings = Settings::default();
        settings.pool.disabled_models = vec!["deepseek-ai/DeepSeek-R1".into()];
        settings.pool.tpm_weight = 0.0;
        handle.replace(settings).await;

        let snapshot = handle.snapshot().await;
        assert!(snapshot.is_model_disabled("deepseek-ai/DeepSeek-R1"));
        assert!(!snapshot.is_model_disabled("deepseek-ai/DeepSeek-V3"));
        assert_eq!(snapshot.pool.tpm_weight, 0.15);
    }
}
