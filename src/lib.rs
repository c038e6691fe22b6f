pub mod classify;
pub mod config;
pub mod error;
pub mod health;
pub mod keys;
pub mod models;
pub mod payload;
pub mod proxy;
pub mod scoring;
pub mod selection;
pub mod server;
pub mod store;
pub mod stream;
pub mod transform;
pub mod upstream;
pub mod usage;

use std::sync::Arc;

use reqwest::Client;
use tracing::{info, warn};

pub use config::{DEFAULT_UPSTREAM, SecuritySettings, Settings, SettingsHandle};
pub use error::{PayloadError, ProbeError, ProxyError};
pub use health::{HealthSupervisor, STARTUP_REFRESH_LIMIT, SweepReport};
pub use keys::{KeyRecord, KeyStore, key_id, mask_key};
pub use models::{ModelInfo, ModelType};
pub use proxy::{Gateway, ProxyReply, ProxyRequest, ProxyResponse};
pub use selection::{KeyMode, Strategy};
pub use store::{KeyPersistence, ModelRegistry, SqliteStore, UsageLedger};
pub use upstream::{HttpProbe, UpstreamEndpoint, UpstreamProbe};
pub use usage::{CurrentStats, UsageRecorder};

/// 组装好的网关：key 池、用量回灌、模型登记、健康检查与 SQLite 持久层。
#[derive(Debug, Clone)]
pub struct App {
    pub gateway: Arc<Gateway>,
    pub health: Arc<HealthSupervisor>,
    pub database: Arc<SqliteStore>,
}

impl App {
    pub async fn with_endpoint(upstream: &str, database_path: &str) -> Result<Self, ProxyError> {
        let endpoint = UpstreamEndpoint::parse(upstream)?;
        let client = Client::new();
        let probe = Arc::new(HttpProbe::new(client.clone(), endpoint.clone()));
        Self::with_probe(client, endpoint, database_path, probe).await
    }

    /// 使用给定的探测实现组装，便于替换余额查询。
    pub async fn with_probe(
        client: Client,
        endpoint: UpstreamEndpoint,
        database_path: &str,
        probe: Arc<dyn UpstreamProbe>,
    ) -> Result<Self, ProxyError> {
        let database = Arc::new(SqliteStore::open(database_path).await?);
        let settings = match database.load_settings().await {
            Ok(Some(settings)) => settings,
            Ok(None) => Settings::default(),
            Err(err) => {
                warn!(error = %err, "stored settings are unreadable, using defaults");
                Settings::default()
            }
        };
        let handle = SettingsHandle::new(settings);
        let store = Arc::new(
            KeyStore::load(handle, Arc::clone(&database) as Arc<dyn KeyPersistence>).await?,
        );
        let models = Arc::clone(&database) as Arc<dyn ModelRegistry>;
        let usage = Arc::new(UsageRecorder::new(
            Arc::clone(&database) as Arc<dyn UsageLedger>,
            Arc::clone(&models),
        ));
        let gateway = Arc::new(Gateway::new(
            client,
            endpoint,
            Arc::clone(&store),
            usage,
            Arc::clone(&probe),
            models,
        ));
        let health = Arc::new(HealthSupervisor::new(store, probe));
        info!(upstream = gateway.upstream().as_str(), "gateway ready");

        Ok(Self {
            gateway,
            health,
            database,
        })
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        self.gateway.store()
    }

    /// 替换运行期配置并写入持久层，返回修正后的配置。
    pub async fn update_settings(&self, settings: Settings) -> Result<Settings, ProxyError> {
        let applied = self.store().settings().replace(settings).await;
        self.database.save_settings(&applied).await?;
        self.store().sort_by_priority().await;
        Ok(applied)
    }
}
