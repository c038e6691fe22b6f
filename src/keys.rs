use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    config::{Settings, SettingsHandle},
    error::ProxyError,
    scoring,
    store::KeyPersistence,
};

/// 单个分钟桶，用于计算每个 key 的 RPM/TPM。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteBucket {
    /// 该分钟起始的 unix 秒。
    pub minute: i64,
    pub requests: u64,
    pub tokens: u64,
}

/// 一个 upstream 凭据及其健康状态。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    pub balance: f64,
    pub last_used: i64,
    pub total_calls: u64,
    pub success_calls: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub disabled: bool,
    pub disabled_at: i64,
    pub last_tested: i64,
    pub rpm: u64,
    pub tpm: u64,
    pub score: f64,
    pub deleted: bool,
    pub is_used: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<MinuteBucket>,
}

impl KeyRecord {
    /// 新登记的 key，余额低于阈值时直接禁用。
    pub fn new(key: impl Into<String>, balance: f64, threshold: f64, now: i64) -> Self {
        let disabled = balance < threshold;
        Self {
            key: key.into(),
            balance,
            last_used: 0,
            total_calls: 0,
            success_calls: 0,
            success_rate: 0.0,
            consecutive_failures: 0,
            disabled,
            disabled_at: if disabled { now } else { 0 },
            last_tested: 0,
            rpm: 0,
            tpm: 0,
            score: 0.0,
            deleted: false,
            is_used: false,
            buckets: Vec::new(),
        }
    }

    /// 可参与选择：未禁用、未删除且余额不低于阈值。
    pub fn is_eligible(&self, threshold: f64) -> bool {
        !self.disabled && !self.deleted && self.balance >= threshold
    }

    pub fn id(&self) -> String {
        key_id(&self.key)
    }

    pub fn masked(&self) -> String {
        mask_key(&self.key)
    }

    pub(crate) fn disable(&mut self, now: i64) -> bool {
        if self.disabled {
            return false;
        }
        self.disabled = true;
        self.disabled_at = now;
        true
    }

    pub(crate) fn enable(&mut self) -> bool {
        let changed = self.disabled;
        self.disabled = false;
        self.disabled_at = 0;
        self.consecutive_failures = 0;
        changed
    }
}

/// key 的稳定短标识，用于管理接口，避免在 URL 中出现明文。
pub fn key_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..9])
}

/// 日志与统计中使用的脱敏 key。
pub fn mask_key(key: &str) -> String {
    if key.chars().count() <= 6 {
        return "******".to_string();
    }
    let prefix: String = key.chars().take(6).collect();
    format!("{prefix}******")
}

/// 余额刷新对单个 key 的处理结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOutcome {
    Updated,
    Disabled,
    Enabled,
    Removed,
    Missing,
}

/// 内存中的 key 表，由一把读写锁保护，并同步写入持久层。
pub struct KeyStore {
    records: RwLock<Vec<KeyRecord>>,
    settings: SettingsHandle,
    persistence: Arc<dyn KeyPersistence>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

impl KeyStore {
    pub fn new(settings: SettingsHandle, persistence: Arc<dyn KeyPersistence>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            settings,
            persistence,
        }
    }

    /// 从持久层加载全部 key 并按优先级排序。
    pub async fn load(
        settings: SettingsHandle,
        persistence: Arc<dyn KeyPersistence>,
    ) -> Result<Self, ProxyError> {
        let records = persistence.load_keys().await?;
        let store = Self::new(settings, persistence);
        let count = records.len();
        *store.records.write().await = records;
        store.sort_by_priority().await;
        info!(count, "loaded api keys from store");
        Ok(store)
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// 全部未删除的 key（副本）。
    pub async fn list(&self) -> Vec<KeyRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| !record.deleted)
            .cloned()
            .collect()
    }

    /// 未禁用且余额达标的 key。
    pub async fn list_active(&self) -> Vec<KeyRecord> {
        let threshold = self.threshold().await;
        self.list()
            .await
            .into_iter()
            .filter(|record| record.is_eligible(threshold))
            .collect()
    }

    pub async fn list_disabled(&self) -> Vec<KeyRecord> {
        self.list()
            .await
            .into_iter()
            .filter(|record| record.disabled)
            .collect()
    }

    pub async fn get(&self, key: &str) -> Option<KeyRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|record| record.key == key && !record.deleted)
            .cloned()
    }

    /// 通过短标识或明文查找。
    pub async fn resolve(&self, id_or_key: &str) -> Option<KeyRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|record| !record.deleted && (record.key == id_or_key || record.id() == id_or_key))
            .cloned()
    }

    /// 新增或更新 key：已存在则更新余额并按阈值重设禁用状态。
    pub async fn add(&self, key: &str, balance: f64) -> Result<KeyRecord, ProxyError> {
        let settings = self.settings.snapshot().await;
        let threshold = settings.pool.min_balance_threshold;
        let now = Utc::now().timestamp();

        let record = {
            let mut records = self.records.write().await;
            match records.iter_mut().find(|record| record.key == key) {
                Some(existing) => {
                    existing.balance = balance;
                    existing.deleted = false;
                    if balance < threshold {
                        existing.disable(now);
                    } else {
                        existing.enable();
                    }
                    existing.score = scoring::standalone_score(existing, &settings);
                    existing.clone()
                }
                None => {
                    let mut record = KeyRecord::new(key, balance, threshold, now);
                    record.score = scoring::standalone_score(&record, &settings);
                    records.push(record.clone());
                    record
                }
            }
        };

        if record.disabled {
            info!(
                key = %record.masked(),
                balance,
                threshold,
                "registered key below threshold, disabled"
            );
        } else {
            info!(key = %record.masked(), balance, "registered key");
        }
        self.persist(&record).await;
        Ok(record)
    }

    /// 软删除：从所有列表中隐藏，直到 purge。
    pub async fn mark_deleted(&self, key: &str) -> Result<(), ProxyError> {
        let record = self
            .modify(key, |record, _| {
                record.deleted = true;
            })
            .await?;
        info!(key = %record.masked(), "key marked deleted");
        Ok(())
    }

    /// 物理删除所有软删除的 key，返回删除数量。
    pub async fn purge_deleted(&self) -> Result<usize, ProxyError> {
        let removed: Vec<KeyRecord> = {
            let mut records = self.records.write().await;
            let (gone, kept): (Vec<_>, Vec<_>) =
                records.drain(..).partition(|record| record.deleted);
            *records = kept;
            gone
        };

        for record in &removed {
            if let Err(err) = self.persistence.delete_key(&record.key).await {
                warn!(key = %record.masked(), error = %err, "failed to delete key from store");
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "purged deleted keys");
        }
        Ok(removed.len())
    }

    /// 立即移除单个 key（余额归零自动清理使用）。
    pub async fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|record| record.key != key);
            before != records.len()
        };
        if removed && let Err(err) = self.persistence.delete_key(key).await {
            warn!(key = %mask_key(key), error = %err, "failed to delete key from store");
        }
        removed
    }

    /// 禁用 key，重复调用无副作用。
    pub async fn set_disabled(&self, key: &str) -> Result<(), ProxyError> {
        let now = Utc::now().timestamp();
        let mut changed = false;
        let record = self
            .modify(key, |record, _| {
                changed = record.disable(now);
            })
            .await?;
        if changed {
            info!(key = %record.masked(), "key disabled");
        }
        Ok(())
    }

    /// 启用 key；余额低于阈值时拒绝。
    pub async fn set_enabled(&self, key: &str) -> Result<(), ProxyError> {
        let mut changed = false;
        let mut rejected = None;
        let record = self
            .modify(key, |record, settings| {
                let threshold = settings.pool.min_balance_threshold;
                if record.balance < threshold {
                    rejected = Some((record.balance, threshold));
                    return;
                }
                changed = record.enable();
            })
            .await?;
        if let Some((balance, threshold)) = rejected {
            return Err(ProxyError::BalanceBelowThreshold { balance, threshold });
        }
        if changed {
            info!(key = %record.masked(), "key enabled");
        }
        Ok(())
    }

    /// 按余额刷新结果更新 key。
    pub async fn apply_balance(&self, key: &str, balance: f64) -> BalanceOutcome {
        let settings = self.settings.snapshot().await;
        if balance <= 0.0 && settings.pool.auto_delete_zero_balance_keys {
            return if self.remove(key).await {
                info!(key = %mask_key(key), balance, "removed key with exhausted balance");
                BalanceOutcome::Removed
            } else {
                BalanceOutcome::Missing
            };
        }

        let threshold = settings.pool.min_balance_threshold;
        let now = Utc::now().timestamp();
        let mut outcome = BalanceOutcome::Updated;
        let result = self
            .modify(key, |record, _| {
                record.balance = balance;
                if balance < threshold {
                    if record.disable(now) {
                        outcome = BalanceOutcome::Disabled;
                    }
                } else if record.disabled {
                    record.enable();
                    outcome = BalanceOutcome::Enabled;
                }
            })
            .await;

        match result {
            Ok(record) => {
                match outcome {
                    BalanceOutcome::Disabled => {
                        info!(
                            key = %record.masked(),
                            balance,
                            threshold,
                            "balance below threshold, key disabled"
                        )
                    }
                    BalanceOutcome::Enabled => {
                        info!(key = %record.masked(), balance, "balance restored, key enabled")
                    }
                    _ => debug!(key = %record.masked(), balance, "balance updated"),
                }
                outcome
            }
            Err(_) => BalanceOutcome::Missing,
        }
    }

    /// 仅更新余额，不改变启用状态。
    pub async fn update_balance(&self, key: &str, balance: f64) -> Result<(), ProxyError> {
        self.modify(key, |record, _| record.balance = balance)
            .await
            .map(|_| ())
    }

    pub async fn mark_tested(&self, key: &str, now: i64) -> Result<(), ProxyError> {
        self.modify(key, |record, _| record.last_tested = now)
            .await
            .map(|_| ())
    }

    /// 记录 key 被选中，持久化尽力而为。
    pub async fn touch(&self, key: &str) {
        let now = Utc::now().timestamp();
        let touched = {
            let mut records = self.records.write().await;
            records.iter_mut().find(|record| record.key == key).map(|record| {
                record.last_used = now;
                record.is_used = true;
                record.clone()
            })
        };

        if let Some(record) = touched {
            let persistence = Arc::clone(&self.persistence);
            tokio::spawn(async move {
                if let Err(err) = persistence.upsert_key(&record).await {
                    debug!(key = %record.masked(), error = %err, "failed to persist last-used");
                }
            });
        }
    }

    /// 对超过 24 小时未使用的 key 清除 is_used 标记，返回仍在使用的 key。
    pub async fn used_keys(&self, now: i64) -> Vec<String> {
        let mut reset = Vec::new();
        let used = {
            let mut records = self.records.write().await;
            let mut used = Vec::new();
            for record in records.iter_mut().filter(|record| !record.deleted && record.is_used) {
                if now - record.last_used > 24 * 3600 {
                    record.is_used = false;
                    reset.push(record.clone());
                } else {
                    used.push(record.key.clone());
                }
            }
            used
        };
        for record in &reset {
            self.persist(record).await;
        }
        used
    }

    /// 全表按优先级分重新排序。
    pub async fn sort_by_priority(&self) {
        let settings = self.settings.snapshot().await;
        let mut records = self.records.write().await;
        for record in records.iter_mut() {
            record.score = scoring::standalone_score(record, &settings);
        }
        scoring::sort_by_priority(&mut records, &settings);
    }

    /// 将当前全部记录写回持久层。
    pub async fn persist_all(&self) {
        let snapshot = self.records.read().await.clone();
        for record in &snapshot {
            self.persist(record).await;
        }
    }

    /// 在写锁下修改单条记录，并同步持久化。
    pub(crate) async fn modify<F>(&self, key: &str, apply: F) -> Result<KeyRecord, ProxyError>
    where
        F: FnOnce(&mut KeyRecord, &Settings),
    {
        let settings = self.settings.snapshot().await;
        let record = {
            let mut records = self.records.write().await;
            let record = records
                .iter_mut()
                .find(|record| record.key == key && !record.deleted)
                .ok_or_else(|| ProxyError::KeyNotFound(mask_key(key)))?;
            apply(record, &settings);
            record.score = scoring::standalone_score(record, &settings);
            record.clone()
        };
        self.persist(&record).await;
        Ok(record)
    }

    async fn persist(&self, record: &KeyRecord) {
        if let Err(err) = self.persistence.upsert_key(record).await {
            warn!(key = %record.masked(), error = %err, "failed to persist key");
        }
    }

    async fn threshold(&self) -> f64 {
        self.settings.snapshot().await.pool.min_balance_threshold
    }
}
