//! 后台健康检查：周期性刷新余额、刷新近期使用过的 key、探测禁用 key 是否可恢复。

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::Semaphore,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ProbeError, ProxyError},
    keys::{BalanceOutcome, KeyStore, mask_key},
    upstream::UpstreamProbe,
};

/// 启动时强制刷新的总时限。
pub const STARTUP_REFRESH_LIMIT: Duration = Duration::from_secs(30);

/// 一轮余额刷新的汇总。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub updated: usize,
    pub disabled: usize,
    pub enabled: usize,
    pub removed: usize,
    pub failed: usize,
    pub timed_out: bool,
}

impl SweepReport {
    fn tally(&mut self, outcome: BalanceOutcome) {
        self.checked += 1;
        match outcome {
            BalanceOutcome::Updated => self.updated += 1,
            BalanceOutcome::Disabled => self.disabled += 1,
            BalanceOutcome::Enabled => self.enabled += 1,
            BalanceOutcome::Removed => self.removed += 1,
            BalanceOutcome::Missing => {}
        }
    }
}

/// 单个禁用 key 的恢复探测结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    LowBalance,
    TestFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub probed: usize,
    pub recovered: usize,
    pub still_disabled: usize,
    pub failed: usize,
}

/// 有界并发地对每个 key 执行 `task`，等待全部完成后返回结果。
/// 单个任务失败不会影响其它 key。
pub async fn fan_out<T, F, Fut>(
    keys: Vec<String>,
    limit: usize,
    task: F,
) -> Vec<(String, Result<T, ProbeError>)>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, ProbeError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    for key in keys {
        let semaphore = Arc::clone(&semaphore);
        let work = task(key.clone());
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            (key, work.await)
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => warn!(error = %err, "health task panicked or was cancelled"),
        }
    }
    results
}

/// 健康检查调度器。
pub struct HealthSupervisor {
    store: Arc<KeyStore>,
    probe: Arc<dyn UpstreamProbe>,
}

impl std::fmt::Debug for HealthSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthSupervisor").finish_non_exhaustive()
    }
}

impl HealthSupervisor {
    pub fn new(store: Arc<KeyStore>, probe: Arc<dyn UpstreamProbe>) -> Self {
        Self { store, probe }
    }

    /// 刷新全部 key 的余额。
    pub async fn refresh_all(&self) -> SweepReport {
        let keys = self
            .store
            .list()
            .await
            .into_iter()
            .map(|record| record.key)
            .collect();
        self.refresh_balances(keys).await
    }

    /// 只刷新近期被选中过的 key；超过 24 小时未使用的会清除标记。
    pub async fn refresh_used_keys(&self) -> SweepReport {
        let used = self.store.used_keys(Utc::now().timestamp()).await;
        if used.is_empty() {
            debug!("no recently used keys to refresh");
            return SweepReport::default();
        }
        self.refresh_balances(used).await
    }

    /// 启动时刷新全部 key，总时长受 `limit` 限制，超时后未完成的检查被取消。
    pub async fn force_refresh(&self, limit: Duration) -> SweepReport {
        let keys: Vec<String> = self
            .store
            .list()
            .await
            .into_iter()
            .map(|record| record.key)
            .collect();
        info!(count = keys.len(), "forcing balance refresh");

        match tokio::time::timeout(limit, self.sweep(keys)).await {
            Ok(report) => {
                self.finish_sweep().await;
                report
            }
            Err(_) => {
                warn!(limit_secs = limit.as_secs_f64(), "balance refresh timed out");
                self.finish_sweep().await;
                SweepReport {
                    timed_out: true,
                    ..SweepReport::default()
                }
            }
        }
    }

    /// 并发查询指定 key 的余额并按阈值更新状态，完成后重排并持久化。
    pub async fn refresh_balances(&self, keys: Vec<String>) -> SweepReport {
        let report = self.sweep(keys).await;
        self.finish_sweep().await;
        info!(
            checked = report.checked,
            disabled = report.disabled,
            enabled = report.enabled,
            removed = report.removed,
            failed = report.failed,
            "balance refresh finished"
        );
        report
    }

    async fn sweep(&self, keys: Vec<String>) -> SweepReport {
        let limit = self.store.settings().snapshot().await.proxy.max_concurrency;
        let probe = Arc::clone(&self.probe);
        let store = Arc::clone(&self.store);

        let results = fan_out(keys, limit, |key| {
            let probe = Arc::clone(&probe);
            let store = Arc::clone(&store);
            async move {
                let balance = probe.check_balance(&key).await?;
                Ok(store.apply_balance(&key, balance).await)
            }
        })
        .await;

        let mut report = SweepReport::default();
        for (key, result) in results {
            match result {
                Ok(outcome) => report.tally(outcome),
                Err(err) => {
                    report.failed += 1;
                    warn!(key = %mask_key(&key), error = %err, "balance check failed");
                }
            }
        }
        report
    }

    async fn finish_sweep(&self) {
        self.store.sort_by_priority().await;
        self.store.persist_all().await;
    }

    /// 对禁用时间超过恢复间隔的 key 做余额检查与测试调用。
    /// 只有测试调用成功才会重新启用。
    pub async fn probe_recovery(&self) -> RecoveryReport {
        let settings = self.store.settings().snapshot().await;
        let threshold = settings.pool.min_balance_threshold;
        let min_age = settings.recovery_period().as_secs() as i64;
        let now = Utc::now().timestamp();

        let due: Vec<String> = self
            .store
            .list_disabled()
            .await
            .into_iter()
            .filter(|record| now - record.disabled_at >= min_age)
            .map(|record| record.key)
            .collect();
        if due.is_empty() {
            return RecoveryReport::default();
        }

        let probe = Arc::clone(&self.probe);
        let store = Arc::clone(&self.store);
        let results = fan_out(due, settings.proxy.max_concurrency, |key| {
            let probe = Arc::clone(&probe);
            let store = Arc::clone(&store);
            async move {
                let balance = probe.check_balance(&key).await?;
                if balance < threshold {
                    if let Err(err) = store.update_balance(&key, balance).await {
                        debug!(key = %mask_key(&key), error = %err, "balance update skipped");
                    }
                    return Ok(RecoveryOutcome::LowBalance);
                }

                let tested = probe.test_completion(&key).await;
                if let Err(err) = store.mark_tested(&key, now).await {
                    debug!(key = %mask_key(&key), error = %err, "test timestamp not recorded");
                }
                if let Err(err) = tested {
                    debug!(key = %mask_key(&key), error = %err, "recovery test call failed");
                    return Ok(RecoveryOutcome::TestFailed);
                }

                if let Err(err) = store.update_balance(&key, balance).await {
                    debug!(key = %mask_key(&key), error = %err, "balance update skipped");
                }
                match store.set_enabled(&key).await {
                    Ok(()) => Ok(RecoveryOutcome::Recovered),
                    Err(ProxyError::KeyNotFound(_)) => {
                        debug!(key = %mask_key(&key), "key removed during recovery check");
                        Ok(RecoveryOutcome::TestFailed)
                    }
                    Err(err) => {
                        warn!(key = %mask_key(&key), error = %err, "failed to re-enable key");
                        Ok(RecoveryOutcome::TestFailed)
                    }
                }
            }
        })
        .await;

        let mut report = RecoveryReport::default();
        for (key, result) in results {
            report.probed += 1;
            match result {
                Ok(RecoveryOutcome::Recovered) => {
                    report.recovered += 1;
                    info!(key = %mask_key(&key), "key recovered");
                }
                Ok(_) => report.still_disabled += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(key = %mask_key(&key), error = %err, "recovery balance check failed");
                }
            }
        }
        self.store.persist_all().await;
        report
    }

    /// 启动三个后台任务。每轮开始前重新读取配置中的周期。
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let balance = {
            let supervisor = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    let period = supervisor.store.settings().snapshot().await.auto_update_period();
                    tokio::time::sleep(period).await;
                    supervisor.refresh_all().await;
                }
            })
        };

        let used = {
            let supervisor = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    let period = supervisor.store.settings().snapshot().await.used_keys_period();
                    tokio::time::sleep(period).await;
                    supervisor.refresh_used_keys().await;
                }
            })
        };

        let recovery = tokio::spawn(async move {
            loop {
                let period = self.store.settings().snapshot().await.recovery_period();
                tokio::time::sleep(period).await;
                let report = self.probe_recovery().await;
                if report.probed > 0 {
                    info!(
                        probed = report.probed,
                        recovered = report.recovered,
                        "recovery probe finished"
                    );
                }
            }
        });

        vec![balance, used, recovery]
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::{HashMap, HashSet},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::*;

    /// 可编排的探测实现：未登记的 key 返回 401。
    #[derive(Default)]
    pub struct FakeProbe {
        pub balances: Mutex<HashMap<String, f64>>,
        pub passing: Mutex<HashSet<String>>,
        pub hanging: Mutex<HashSet<String>>,
        pub slow: Mutex<HashSet<String>>,
        pub balance_calls: AtomicUsize,
        pub test_calls: AtomicUsize,
    }

    impl FakeProbe {
        pub fn with_balance(self, key: &str, balance: f64) -> Self {
            self.balances.lock().unwrap().insert(key.to_string(), balance);
            self
        }

        pub fn passing(self, key: &str) -> Self {
            self.passing.lock().unwrap().insert(key.to_string());
            self
        }

        pub fn hanging(self, key: &str) -> Self {
            self.hanging.lock().unwrap().insert(key.to_string());
            self
        }

        /// 测试调用延迟 100ms 才返回。
        pub fn slow(self, key: &str) -> Self {
            self.slow.lock().unwrap().insert(key.to_string());
            self
        }
    }

    #[async_trait]
    impl UpstreamProbe for FakeProbe {
        async fn check_balance(&self, key: &str) -> Result<f64, ProbeError> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            let hang = self.hanging.lock().unwrap().contains(key);
            if hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let balance = self.balances.lock().unwrap().get(key).copied();
            balance.ok_or(ProbeError::Status {
                status: StatusCode::UNAUTHORIZED,
                body: "unauthorized".into(),
            })
        }

        async fn test_completion(&self, key: &str) -> Result<(), ProbeError> {
            self.test_calls.fetch_add(1, Ordering::SeqCst);
            let slow = self.slow.lock().unwrap().contains(key);
            if slow {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if self.passing.lock().unwrap().contains(key) {
                Ok(())
            } else {
                Err(ProbeError::MissingChoices)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FakeProbe;
    use super::*;
    use crate::{config::Settings, keys::testing::store_with};

    async fn supervisor(
        settings: Settings,
        probe: FakeProbe,
    ) -> (HealthSupervisor, Arc<KeyStore>, Arc<FakeProbe>) {
        let (store, _) = store_with(settings);
        let store = Arc::new(store);
        let probe = Arc::new(probe);
        (
            HealthSupervisor::new(Arc::clone(&store), probe.clone()),
            store,
            probe,
        )
    }

    async fn age_disabled(store: &KeyStore, key: &str, secs: i64) {
        store
            .modify(key, |record, _| record.disabled_at -= secs)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn balance_sweep_applies_threshold_rules() {
        let probe = FakeProbe::default()
            .with_balance("sk-drained-key", 0.0)
            .with_balance("sk-low-key-01", 0.5)
            .with_balance("sk-back-key-01", 5.0)
            .with_balance("sk-steady-key", 9.0);
        let (supervisor, store, _) = supervisor(Settings::default(), probe).await;
        store.add("sk-drained-key", 3.0).await.unwrap();
        store.add("sk-low-key-01", 3.0).await.unwrap();
        store.add("sk-back-key-01", 0.1).await.unwrap();
        store.add("sk-steady-key", 3.0).await.unwrap();
        store.add("sk-broken-key", 3.0).await.unwrap();

        let report = supervisor.refresh_all().await;
        assert_eq!(report.checked, 4);
        assert_eq!(report.removed, 1);
        assert_eq!(report.disabled, 1);
        assert_eq!(report.enabled, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);

        assert!(store.get("sk-drained-key").await.is_none());
        assert!(store.get("sk-low-key-01").await.unwrap().disabled);
        assert!(!store.get("sk-back-key-01").await.unwrap().disabled);
        assert_eq!(store.get("sk-steady-key").await.unwrap().balance, 9.0);
        assert_eq!(store.get("sk-broken-key").await.unwrap().balance, 3.0);
    }

    #[tokio::test]
    async fn hanging_key_does_not_block_others() {
        let probe = FakeProbe::default()
            .with_balance("sk-fast-key-1", 6.0)
            .with_balance("sk-slow-key-1", 6.0)
            .hanging("sk-slow-key-1");
        let (supervisor, store, _) = supervisor(Settings::default(), probe).await;
        store.add("sk-fast-key-1", 1.0).await.unwrap();
        store.add("sk-slow-key-1", 1.0).await.unwrap();

        let report = supervisor.force_refresh(Duration::from_millis(300)).await;
        assert!(report.timed_out);
        assert_eq!(store.get("sk-fast-key-1").await.unwrap().balance, 6.0);
        assert_eq!(store.get("sk-slow-key-1").await.unwrap().balance, 1.0);
    }

    #[tokio::test]
    async fn recovery_requires_successful_test_call() {
        let probe = FakeProbe::default()
            .with_balance("sk-recover-ok", 5.0)
            .with_balance("sk-recover-bad", 5.0)
            .passing("sk-recover-ok");
        let (supervisor, store, probe) = supervisor(Settings::default(), probe).await;
        for key in ["sk-recover-ok", "sk-recover-bad"] {
            store.add(key, 5.0).await.unwrap();
            store.set_disabled(key).await.unwrap();
            age_disabled(&store, key, 11 * 60).await;
        }

        let report = supervisor.probe_recovery().await;
        assert_eq!(report.probed, 2);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.still_disabled, 1);
        assert_eq!(probe.test_calls.load(Ordering::SeqCst), 2);

        assert!(!store.get("sk-recover-ok").await.unwrap().disabled);
        let bad = store.get("sk-recover-bad").await.unwrap();
        assert!(bad.disabled);
        assert!(bad.last_tested > 0);
    }

    #[tokio::test]
    async fn key_purged_mid_recovery_is_skipped() {
        let probe = FakeProbe::default()
            .with_balance("sk-vanishing-key", 5.0)
            .passing("sk-vanishing-key")
            .slow("sk-vanishing-key");
        let (supervisor, store, _) = supervisor(Settings::default(), probe).await;
        store.add("sk-vanishing-key", 5.0).await.unwrap();
        store.set_disabled("sk-vanishing-key").await.unwrap();
        age_disabled(&store, "sk-vanishing-key", 11 * 60).await;

        let (report, removed) = tokio::join!(supervisor.probe_recovery(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.mark_deleted("sk-vanishing-key").await.unwrap();
            store.purge_deleted().await.unwrap()
        });

        assert_eq!(removed, 1);
        assert_eq!(report.probed, 1);
        assert_eq!(report.recovered, 0);
        assert_eq!(report.still_disabled, 1);
        assert!(store.get("sk-vanishing-key").await.is_none());
    }

    #[tokio::test]
    async fn recovery_skips_recent_and_low_balance_keys() {
        let probe = FakeProbe::default()
            .with_balance("sk-too-recent", 5.0)
            .with_balance("sk-still-poor", 0.3)
            .passing("sk-too-recent")
            .passing("sk-still-poor");
        let (supervisor, store, probe) = supervisor(Settings::default(), probe).await;
        store.add("sk-too-recent", 5.0).await.unwrap();
        store.set_disabled("sk-too-recent").await.unwrap();
        store.add("sk-still-poor", 0.1).await.unwrap();
        age_disabled(&store, "sk-still-poor", 3600).await;

        let report = supervisor.probe_recovery().await;
        assert_eq!(report.probed, 1);
        assert_eq!(report.still_disabled, 1);
        assert_eq!(probe.test_calls.load(Ordering::SeqCst), 0);

        let poor = store.get("sk-still-poor").await.unwrap();
        assert!(poor.disabled);
        assert_eq!(poor.balance, 0.3);
        assert!(store.get("sk-too-recent").await.unwrap().disabled);
    }

    #[tokio::test]
    async fn used_key_refresh_only_touches_used_keys() {
        let probe = FakeProbe::default()
            .with_balance("sk-used-key-1", 4.0)
            .with_balance("sk-idle-key-1", 4.0);
        let (supervisor, store, probe) = supervisor(Settings::default(), probe).await;
        store.add("sk-used-key-1", 2.0).await.unwrap();
        store.add("sk-idle-key-1", 2.0).await.unwrap();
        store.touch("sk-used-key-1").await;

        let report = supervisor.refresh_used_keys().await;
        assert_eq!(report.checked, 1);
        assert_eq!(probe.balance_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("sk-used-key-1").await.unwrap().balance, 4.0);
        assert_eq!(store.get("sk-idle-key-1").await.unwrap().balance, 2.0);
    }

    #[tokio::test]
    async fn fan_out_respects_concurrency_limit() {
        use std::sync::atomic::AtomicUsize;

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let keys: Vec<String> = (0..12).map(|i| format!("sk-{i}")).collect();

        let results = fan_out(keys, 3, |_key| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ProbeError>(())
            }
        })
        .await;

        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
