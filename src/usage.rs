//! 请求完成后的用量回灌：全局分钟序列、单 key 滚动窗口、成功率与连续失败计数。

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    keys::{KeyRecord, KeyStore, MinuteBucket, mask_key},
    store::{ModelRegistry, UsageEntry, UsageLedger},
};

/// 单 key 保留的分钟桶数量。
pub const KEY_BUCKET_LIMIT: usize = 5;
/// 单 key 滚动窗口长度（秒）。
pub const KEY_WINDOW_SECS: i64 = 300;

/// 一次 upstream 调用的结果。
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub key: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub success: bool,
}

impl UsageReport {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// 管理接口展示的全局实时统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CurrentStats {
    pub rpm: u64,
    pub tpm: u64,
    pub rpd: u64,
    pub tpd: u64,
}

/// 进程级分钟序列与当日累计。
#[derive(Debug, Default)]
struct GlobalSeries {
    buckets: VecDeque<MinuteBucket>,
    day: Option<NaiveDate>,
    daily_requests: u64,
    daily_tokens: u64,
}

impl GlobalSeries {
    fn record(&mut self, requests: u64, tokens: u64, now: DateTime<Local>, max_entries: usize) {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily_requests = 0;
            self.daily_tokens = 0;
        }
        self.daily_requests += requests;
        self.daily_tokens += tokens;

        let minute = minute_start(now.timestamp());
        match self.buckets.back_mut() {
            Some(last) if last.minute == minute => {
                last.requests += requests;
                last.tokens += tokens;
            }
            _ => {
                self.buckets.push_back(MinuteBucket {
                    minute,
                    requests,
                    tokens,
                });
                while self.buckets.len() > max_entries.max(1) {
                    self.buckets.pop_front();
                }
            }
        }
    }

    fn current(&self, now: DateTime<Local>) -> CurrentStats {
        let cutoff = now.timestamp() - 60;
        let (rpm, tpm) = self
            .buckets
            .iter()
            .filter(|bucket| bucket.minute >= minute_start(cutoff))
            .fold((0, 0), |(requests, tokens), bucket| {
                (requests + bucket.requests, tokens + bucket.tokens)
            });
        let same_day = self.day == Some(now.date_naive());
        CurrentStats {
            rpm,
            tpm,
            rpd: if same_day { self.daily_requests } else { 0 },
            tpd: if same_day { self.daily_tokens } else { 0 },
        }
    }
}

fn minute_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(60)
}

/// 把一次调用计入 key 的分钟桶，返回重新计算的 (rpm, tpm)。
/// 超出 5 个桶或早于 5 分钟的桶都会被丢弃。
pub fn record_bucket(
    buckets: &mut Vec<MinuteBucket>,
    now: i64,
    requests: u64,
    tokens: u64,
) -> (u64, u64) {
    let minute = minute_start(now);
    match buckets.last_mut() {
        Some(last) if last.minute == minute => {
            last.requests += requests;
            last.tokens += tokens;
        }
        _ => {
            buckets.push(MinuteBucket {
                minute,
                requests,
                tokens,
            });
            if buckets.len() > KEY_BUCKET_LIMIT {
                let excess = buckets.len() - KEY_BUCKET_LIMIT;
                buckets.drain(..excess);
            }
        }
    }

    let cutoff = minute_start(now - KEY_WINDOW_SECS);
    buckets.retain(|bucket| bucket.minute >= cutoff);

    if buckets.is_empty() {
        return (0, 0);
    }
    let minutes = buckets.len() as u64;
    let (total_requests, total_tokens) = buckets
        .iter()
        .fold((0, 0), |(requests, tokens), bucket| {
            (requests + bucket.requests, tokens + bucket.tokens)
        });
    (total_requests / minutes, total_tokens / minutes)
}

/// 更新调用计数；失败次数达到上限时禁用 key，返回是否因此被禁用。
pub fn apply_outcome(record: &mut KeyRecord, success: bool, now: i64, max_failures: u32) -> bool {
    record.total_calls += 1;
    if success {
        record.success_calls += 1;
        record.consecutive_failures = 0;
    } else {
        record.consecutive_failures += 1;
    }
    record.success_rate = record.success_calls as f64 / record.total_calls as f64;

    !success && record.consecutive_failures >= max_failures.max(1) && record.disable(now)
}

/// 用量回灌入口，由代理在每次 upstream 调用结束后调用。
pub struct UsageRecorder {
    global: Mutex<GlobalSeries>,
    ledger: Arc<dyn UsageLedger>,
    models: Arc<dyn ModelRegistry>,
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder").finish_non_exhaustive()
    }
}

impl UsageRecorder {
    pub fn new(ledger: Arc<dyn UsageLedger>, models: Arc<dyn ModelRegistry>) -> Self {
        Self {
            global: Mutex::new(GlobalSeries::default()),
            ledger,
            models,
        }
    }

    pub fn current(&self) -> CurrentStats {
        self.lock_global().current(Local::now())
    }

    /// 依次更新全局序列、key 统计、日账本与模型调用计数，最后重排 key 表。
    pub async fn report(&self, store: &KeyStore, usage: UsageReport) {
        let now = Local::now();
        let settings = store.settings().snapshot().await;
        let tokens = usage.total_tokens();

        self.lock_global()
            .record(1, tokens, now, settings.pool.max_stats_entries);

        let timestamp = Utc::now().timestamp();
        let mut newly_disabled = false;
        let updated = store
            .modify(&usage.key, |record, settings| {
                let (rpm, tpm) = record_bucket(&mut record.buckets, timestamp, 1, tokens);
                record.rpm = rpm;
                record.tpm = tpm;
                newly_disabled = apply_outcome(
                    record,
                    usage.success,
                    timestamp,
                    settings.pool.max_consecutive_failures,
                );
            })
            .await;

        match updated {
            Ok(record) if newly_disabled => warn!(
                key = %record.masked(),
                failures = record.consecutive_failures,
                "too many consecutive failures, key disabled"
            ),
            Ok(record) => debug!(
                key = %record.masked(),
                success = usage.success,
                rpm = record.rpm,
                tpm = record.tpm,
                "usage recorded"
            ),
            Err(err) => debug!(key = %mask_key(&usage.key), error = %err, "usage for unknown key"),
        }

        let entry = UsageEntry {
            key: usage.key.clone(),
            model: usage.model.clone(),
            requests: 1,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            success: usage.success,
            at: now,
        };
        if let Err(err) = self.ledger.append_usage(&entry).await {
            warn!(error = %err, "failed to append daily usage");
        }
        if usage.success && !usage.model.is_empty() {
            match self.models.record_model_call(&usage.model).await {
                Ok(true) => {}
                Ok(false) => debug!(model = %usage.model, "model not registered, call not counted"),
                Err(err) => warn!(model = %usage.model, error = %err, "failed to count model call"),
            }
        }

        store.sort_by_priority().await;
    }

    fn lock_global(&self) -> MutexGuard<'_, GlobalSeries> {
        self.global
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::BTreeMap, sync::Mutex};

    use async_trait::async_trait;

    use crate::{error::ProxyError, models::ModelInfo};

    use super::*;

    /// 内存中的日账本与模型登记表。
    #[derive(Default)]
    pub struct MemoryLedger {
        pub entries: Mutex<Vec<UsageEntry>>,
        pub models: Mutex<BTreeMap<String, ModelInfo>>,
    }

    impl MemoryLedger {
        pub fn recorder(self: &Arc<Self>) -> UsageRecorder {
            UsageRecorder::new(self.clone(), self.clone())
        }
    }

    #[async_trait]
    impl UsageLedger for MemoryLedger {
        async fn append_usage(&self, entry: &UsageEntry) -> Result<(), ProxyError> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl ModelRegistry for MemoryLedger {
        async fn find_model(&self, id: &str) -> Result<Option<ModelInfo>, ProxyError> {
            Ok(self.models.lock().unwrap().get(id).cloned())
        }

        async fn save_model(&self, model: &ModelInfo) -> Result<(), ProxyError> {
            let mut models = self.models.lock().unwrap();
            let call_count = models.get(&model.id).map_or(0, |known| known.call_count);
            models.insert(
                model.id.clone(),
                ModelInfo {
                    call_count,
                    ..model.clone()
                },
            );
            Ok(())
        }

        async fn sync_models(&self, ids: &[String]) -> Result<usize, ProxyError> {
            let mut models = self.models.lock().unwrap();
            models.retain(|id, _| ids.contains(id));
            for id in ids {
                models
                    .entry(id.clone())
                    .or_insert_with(|| ModelInfo::discovered(id));
            }
            Ok(ids.len())
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, ProxyError> {
            Ok(self.models.lock().unwrap().values().cloned().collect())
        }

        async fn record_model_call(&self, id: &str) -> Result<bool, ProxyError> {
            Ok(self
                .models
                .lock()
                .unwrap()
                .get_mut(id)
                .map(|model| model.call_count += 1)
                .is_some())
        }
    }
}
