use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, Timelike, Utc};
use serde::Serialize;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use tracing::{debug, info};

use crate::{
    config::Settings,
    error::ProxyError,
    keys::{KeyRecord, mask_key},
    models::{ModelInfo, ModelType},
};

/// 日账本保留天数。
pub const LEDGER_RETENTION_DAYS: i64 = 30;

/// key 表与配置的持久层。
#[async_trait]
pub trait KeyPersistence: Send + Sync {
    async fn load_keys(&self) -> Result<Vec<KeyRecord>, ProxyError>;
    async fn upsert_key(&self, record: &KeyRecord) -> Result<(), ProxyError>;
    async fn delete_key(&self, key: &str) -> Result<(), ProxyError>;
    async fn load_settings(&self) -> Result<Option<Settings>, ProxyError>;
    async fn save_settings(&self, settings: &Settings) -> Result<(), ProxyError>;
}

/// 一条日账本记录。
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEntry {
    pub key: String,
    pub model: String,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub success: bool,
    pub at: DateTime<Local>,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn append_usage(&self, entry: &UsageEntry) -> Result<(), ProxyError>;
}

/// 模型登记表。
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// 只返回未被软删除的模型。
    async fn find_model(&self, id: &str) -> Result<Option<ModelInfo>, ProxyError>;
    /// 写入类别、策略与标记，调用计数保持不变。
    async fn save_model(&self, model: &ModelInfo) -> Result<(), ProxyError>;
    /// 用 upstream 列表替换登记表：不在列表中的软删除，已有行保留类别与策略。
    async fn sync_models(&self, ids: &[String]) -> Result<usize, ProxyError>;
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProxyError>;
    /// 只累加已登记的模型；返回是否命中。
    async fn record_model_call(&self, id: &str) -> Result<bool, ProxyError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestCounts {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounts {
    pub total: i64,
    pub prompt: i64,
    pub completion: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageCounter {
    pub requests: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyUsage {
    pub hour: i64,
    pub requests: i64,
    pub tokens: i64,
}

/// 某一天的汇总统计。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub requests: RequestCounts,
    pub tokens: TokenCounts,
    pub models: BTreeMap<String, UsageCounter>,
    pub hourly: Vec<HourlyUsage>,
    pub keys: BTreeMap<String, UsageCounter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub date: String,
    pub requests: i64,
    pub tokens: i64,
}

/// SQLite 持久层，实现 key 表、配置与日账本。
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    rotated_on: Mutex<Option<NaiveDate>>,
}

impl SqliteStore {
    pub async fn open(database_path: &str) -> Result<Self, ProxyError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            rotated_on: Mutex::new(None),
        };
        store.initialize_schema().await?;
        info!(path = database_path, "sqlite store ready");
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                api_key TEXT PRIMARY KEY,
                balance REAL NOT NULL DEFAULT 0,
                last_used INTEGER NOT NULL DEFAULT 0,
                total_calls INTEGER NOT NULL DEFAULT 0,
                success_calls INTEGER NOT NULL DEFAULT 0,
                success_rate REAL NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                disabled_at INTEGER NOT NULL DEFAULT 0,
                last_tested INTEGER NOT NULL DEFAULT 0,
                rpm INTEGER NOT NULL DEFAULT 0,
                tpm INTEGER NOT NULL DEFAULT 0,
                score REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.upgrade_api_keys_schema().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_usage (
                date TEXT NOT NULL,
                hour INTEGER NOT NULL,
                model TEXT NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date, hour, model)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_key_usage (
                date TEXT NOT NULL,
                masked_key TEXT NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                tokens INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date, masked_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                model_type INTEGER NOT NULL DEFAULT 1,
                strategy_id INTEGER,
                is_free INTEGER NOT NULL DEFAULT 0,
                is_giftable INTEGER NOT NULL DEFAULT 0,
                call_count INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 旧库缺少软删除与使用标记列时补齐。
    async fn upgrade_api_keys_schema(&self) -> Result<(), ProxyError> {
        if !self.api_keys_column_exists("is_deleted").await? {
            sqlx::query("ALTER TABLE api_keys ADD COLUMN is_deleted INTEGER NOT NULL DEFAULT 0")
                .execute(&self.pool)
                .await?;
        }
        if !self.api_keys_column_exists("is_used").await? {
            sqlx::query("ALTER TABLE api_keys ADD COLUMN is_used INTEGER NOT NULL DEFAULT 0")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn api_keys_column_exists(&self, column: &str) -> Result<bool, ProxyError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM pragma_table_info('api_keys') WHERE name = ? LIMIT 1",
        )
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;

        Ok(exists.is_some())
    }

    /// 删除保留期之外的账本数据，同一天只执行一次。
    async fn rotate_ledger(&self, today: NaiveDate) -> Result<(), ProxyError> {
        {
            let mut rotated = self
                .rotated_on
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *rotated == Some(today) {
                return Ok(());
            }
            *rotated = Some(today);
        }

        let cutoff = (today - Duration::days(LEDGER_RETENTION_DAYS - 1)).to_string();
        let usage = sqlx::query("DELETE FROM daily_usage WHERE date < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        let keys = sqlx::query("DELETE FROM daily_key_usage WHERE date < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        let removed = usage.rows_affected() + keys.rows_affected();
        if removed > 0 {
            debug!(cutoff, removed, "rotated daily usage ledger");
        }
        Ok(())
    }

    /// 指定日期的统计；没有任何记录时返回 None。
    pub async fn daily_stats(&self, date: NaiveDate) -> Result<Option<DailyStats>, ProxyError> {
        let date = date.to_string();
        let rows = sqlx::query(
            r#"
            SELECT hour, model, requests, success, failed, prompt_tokens, completion_tokens
            FROM daily_usage
            WHERE date = ?
            ORDER BY hour ASC, model ASC
            "#,
        )
        .bind(&date)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut stats = DailyStats {
            date: date.clone(),
            ..DailyStats::default()
        };
        let mut hourly: BTreeMap<i64, UsageCounter> = BTreeMap::new();
        for row in rows {
            let hour: i64 = row.try_get("hour")?;
            let model: String = row.try_get("model")?;
            let requests: i64 = row.try_get("requests")?;
            let prompt: i64 = row.try_get("prompt_tokens")?;
            let completion: i64 = row.try_get("completion_tokens")?;
            let tokens = prompt + completion;

            stats.requests.total += requests;
            stats.requests.success += row.try_get::<i64, _>("success")?;
            stats.requests.failed += row.try_get::<i64, _>("failed")?;
            stats.tokens.prompt += prompt;
            stats.tokens.completion += completion;
            stats.tokens.total += tokens;

            let per_model = stats.models.entry(model).or_default();
            per_model.requests += requests;
            per_model.tokens += tokens;

            let per_hour = hourly.entry(hour).or_default();
            per_hour.requests += requests;
            per_hour.tokens += tokens;
        }
        stats.hourly = hourly
            .into_iter()
            .map(|(hour, usage)| HourlyUsage {
                hour,
                requests: usage.requests,
                tokens: usage.tokens,
            })
            .collect();

        let key_rows = sqlx::query(
            "SELECT masked_key, requests, tokens FROM daily_key_usage WHERE date = ? ORDER BY masked_key",
        )
        .bind(&date)
        .fetch_all(&self.pool)
        .await?;
        for row in key_rows {
            stats.keys.insert(
                row.try_get("masked_key")?,
                UsageCounter {
                    requests: row.try_get("requests")?,
                    tokens: row.try_get("tokens")?,
                },
            );
        }

        Ok(Some(stats))
    }

    /// 保留期内每天的请求数与 token 数，按日期倒序。
    pub async fn recent_days(&self) -> Result<Vec<DaySummary>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT
                date,
                COALESCE(SUM(requests), 0) AS requests,
                COALESCE(SUM(prompt_tokens + completion_tokens), 0) AS tokens
            FROM daily_usage
            GROUP BY date
            ORDER BY date DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let days = rows
            .into_iter()
            .map(|row| -> Result<DaySummary, sqlx::Error> {
                Ok(DaySummary {
                    date: row.try_get("date")?,
                    requests: row.try_get("requests")?,
                    tokens: row.try_get("tokens")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(days)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<KeyRecord, sqlx::Error> {
    Ok(KeyRecord {
        key: row.try_get("api_key")?,
        balance: row.try_get("balance")?,
        last_used: row.try_get("last_used")?,
        total_calls: row.try_get::<i64, _>("total_calls")?.max(0) as u64,
        success_calls: row.try_get::<i64, _>("success_calls")?.max(0) as u64,
        success_rate: row.try_get("success_rate")?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")?.max(0) as u32,
        disabled: row.try_get("disabled")?,
        disabled_at: row.try_get("disabled_at")?,
        last_tested: row.try_get("last_tested")?,
        rpm: row.try_get::<i64, _>("rpm")?.max(0) as u64,
        tpm: row.try_get::<i64, _>("tpm")?.max(0) as u64,
        score: row.try_get("score")?,
        deleted: row.try_get("is_deleted")?,
        is_used: row.try_get("is_used")?,
        buckets: Vec::new(),
    })
}

fn model_from_row(row: &SqliteRow) -> Result<ModelInfo, sqlx::Error> {
    let strategy: Option<i64> = row.try_get("strategy_id")?;
    Ok(ModelInfo {
        id: row.try_get("id")?,
        model_type: ModelType::from_code(row.try_get("model_type")?),
        strategy: strategy.and_then(|id| u8::try_from(id).ok()),
        is_free: row.try_get("is_free")?,
        is_giftable: row.try_get("is_giftable")?,
        call_count: row.try_get::<i64, _>("call_count")?.max(0) as u64,
    })
}

#[async_trait]
impl KeyPersistence for SqliteStore {
    async fn load_keys(&self) -> Result<Vec<KeyRecord>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT
                api_key, balance, last_used, total_calls, success_calls, success_rate,
                consecutive_failures, disabled, disabled_at, last_tested, rpm, tpm, score,
                is_deleted, is_used
            FROM api_keys
            ORDER BY score DESC, api_key ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn upsert_key(&self, record: &KeyRecord) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (
                api_key, balance, last_used, total_calls, success_calls, success_rate,
                consecutive_failures, disabled, disabled_at, last_tested, rpm, tpm, score,
                is_deleted, is_used
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(api_key) DO UPDATE SET
                balance = excluded.balance,
                last_used = excluded.last_used,
                total_calls = excluded.total_calls,
                success_calls = excluded.success_calls,
                success_rate = excluded.success_rate,
                consecutive_failures = excluded.consecutive_failures,
                disabled = excluded.disabled,
                disabled_at = excluded.disabled_at,
                last_tested = excluded.last_tested,
                rpm = excluded.rpm,
                tpm = excluded.tpm,
                score = excluded.score,
                is_deleted = excluded.is_deleted,
                is_used = excluded.is_used
            "#,
        )
        .bind(&record.key)
        .bind(record.balance)
        .bind(record.last_used)
        .bind(record.total_calls as i64)
        .bind(record.success_calls as i64)
        .bind(record.success_rate)
        .bind(i64::from(record.consecutive_failures))
        .bind(record.disabled)
        .bind(record.disabled_at)
        .bind(record.last_tested)
        .bind(record.rpm as i64)
        .bind(record.tpm as i64)
        .bind(record.score)
        .bind(record.deleted)
        .bind(record.is_used)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), ProxyError> {
        sqlx::query("DELETE FROM api_keys WHERE api_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_settings(&self) -> Result<Option<Settings>, ProxyError> {
        let payload =
            sqlx::query_scalar::<_, String>("SELECT payload FROM settings WHERE id = 1 LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        payload
            .map(|raw| serde_json::from_str(&raw).map_err(ProxyError::Settings))
            .transpose()
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), ProxyError> {
        let payload = serde_json::to_string(settings).map_err(ProxyError::Settings)?;
        sqlx::query(
            r#"
            INSERT INTO settings (id, payload, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(payload)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for SqliteStore {
    async fn append_usage(&self, entry: &UsageEntry) -> Result<(), ProxyError> {
        let today = entry.at.date_naive();
        self.rotate_ledger(today).await?;

        let date = today.to_string();
        let requests = entry.requests as i64;
        let (success, failed) = if entry.success {
            (requests, 0)
        } else {
            (0, requests)
        };
        let prompt = entry.prompt_tokens as i64;
        let completion = entry.completion_tokens as i64;
        let model = if entry.model.is_empty() {
            "unknown"
        } else {
            entry.model.as_str()
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO daily_usage (
                date, hour, model, requests, success, failed, prompt_tokens, completion_tokens
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date, hour, model) DO UPDATE SET
                requests = requests + excluded.requests,
                success = success + excluded.success,
                failed = failed + excluded.failed,
                prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                completion_tokens = completion_tokens + excluded.completion_tokens
            "#,
        )
        .bind(&date)
        .bind(i64::from(entry.at.hour()))
        .bind(model)
        .bind(requests)
        .bind(success)
        .bind(failed)
        .bind(prompt)
        .bind(completion)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO daily_key_usage (date, masked_key, requests, tokens)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(date, masked_key) DO UPDATE SET
                requests = requests + excluded.requests,
                tokens = tokens + excluded.tokens
            "#,
        )
        .bind(&date)
        .bind(mask_key(&entry.key))
        .bind(requests)
        .bind(prompt + completion)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ModelRegistry for SqliteStore {
    async fn find_model(&self, id: &str) -> Result<Option<ModelInfo>, ProxyError> {
        let row = sqlx::query(
            r#"
            SELECT id, model_type, strategy_id, is_free, is_giftable, call_count
            FROM models
            WHERE id = ? AND is_deleted = 0
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(model_from_row).transpose()?)
    }

    async fn save_model(&self, model: &ModelInfo) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            INSERT INTO models (id, model_type, strategy_id, is_free, is_giftable, is_deleted, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(id) DO UPDATE SET
                model_type = excluded.model_type,
                strategy_id = excluded.strategy_id,
                is_free = excluded.is_free,
                is_giftable = excluded.is_giftable,
                is_deleted = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&model.id)
        .bind(model.model_type.code())
        .bind(model.strategy.map(i64::from))
        .bind(model.is_free)
        .bind(model.is_giftable)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sync_models(&self, ids: &[String]) -> Result<usize, ProxyError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE models SET is_deleted = 1, updated_at = ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        for id in ids {
            let discovered = ModelInfo::discovered(id);
            sqlx::query(
                r#"
                INSERT INTO models (id, model_type, is_free, is_giftable, is_deleted, updated_at)
                VALUES (?, ?, ?, ?, 0, ?)
                ON CONFLICT(id) DO UPDATE SET
                    is_free = excluded.is_free,
                    is_giftable = excluded.is_giftable,
                    is_deleted = 0,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&discovered.id)
            .bind(discovered.model_type.code())
            .bind(discovered.is_free)
            .bind(discovered.is_giftable)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if discovered.is_reasoning() {
                sqlx::query("UPDATE models SET model_type = ? WHERE id = ?")
                    .bind(ModelType::Reasoning.code())
                    .bind(&discovered.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        info!(count = ids.len(), "model registry synced");
        Ok(ids.len())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT id, model_type, strategy_id, is_free, is_giftable, call_count
            FROM models
            WHERE is_deleted = 0
            ORDER BY call_count DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let models = rows
            .iter()
            .map(model_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(models)
    }

    async fn record_model_call(&self, id: &str) -> Result<bool, ProxyError> {
        let result = sqlx::query(
            "UPDATE models SET call_count = call_count + 1 WHERE id = ? AND is_deleted = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    async fn open_temp() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keypool.db");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn entry(key: &str, model: &str, at: DateTime<Local>, success: bool) -> UsageEntry {
        UsageEntry {
            key: key.to_string(),
            model: model.to_string(),
            requests: 1,
            prompt_tokens: 10,
            completion_tokens: 20,
            success,
            at,
        }
    }

    #[tokio::test]
    async fn key_rows_round_trip_through_sqlite() {
        let (_dir, store) = open_temp().await;
        let mut record = KeyRecord::new("sk-persisted-key", 3.5, 0.8, 0);
        record.total_calls = 7;
        record.success_calls = 6;
        record.is_used = true;
        store.upsert_key(&record).await.unwrap();

        record.balance = 2.0;
        record.deleted = true;
        store.upsert_key(&record).await.unwrap();

        let loaded = store.load_keys().await.unwrap();
        assert_eq!(loaded, vec![record.clone()]);

        store.delete_key(&record.key).await.unwrap();
        assert!(store.load_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_persist_as_json() {
        let (_dir, store) = open_temp().await;
        assert!(store.load_settings().await.unwrap().is_none());

        let mut settings = Settings::default();
        settings.pool.min_balance_threshold = 1.5;
        settings.pool.model_key_strategies.insert("deepseek-ai/DeepSeek-R1".into(), 5);
        store.save_settings(&settings).await.unwrap();
        store.save_settings(&settings).await.unwrap();

        assert_eq!(store.load_settings().await.unwrap(), Some(settings));
    }

    #[tokio::test]
    async fn ledger_aggregates_by_hour_model_and_key() {
        let (_dir, store) = open_temp().await;
        let at = Local.with_ymd_and_hms(2026, 5, 4, 9, 15, 0).unwrap();
        store.append_usage(&entry("sk-alpha-key", "m1", at, true)).await.unwrap();
        store.append_usage(&entry("sk-alpha-key", "m1", at, false)).await.unwrap();
        store
            .append_usage(&entry("sk-bravo-key", "m2", at + Duration::hours(2), true))
            .await
            .unwrap();

        let stats = store.daily_stats(at.date_naive()).await.unwrap().unwrap();
        assert_eq!(stats.requests, RequestCounts { total: 3, success: 2, failed: 1 });
        assert_eq!(stats.tokens.total, 90);
        assert_eq!(stats.models["m1"], UsageCounter { requests: 2, tokens: 60 });
        assert_eq!(stats.hourly.len(), 2);
        assert_eq!(stats.hourly[0].hour, 9);
        assert_eq!(stats.keys["sk-alp******"].requests, 2);

        let days = store.recent_days().await.unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].requests, 3);
    }

    #[tokio::test]
    async fn ledger_rotates_old_days() {
        let (_dir, store) = open_temp().await;
        let old = Local.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let now = Local.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        store.append_usage(&entry("sk-old-key-1", "m", old, true)).await.unwrap();
        store.append_usage(&entry("sk-new-key-1", "m", now, true)).await.unwrap();

        assert!(store.daily_stats(old.date_naive()).await.unwrap().is_none());
        assert!(store.daily_stats(now.date_naive()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn model_registry_keeps_manual_metadata_across_syncs() {
        let (_dir, store) = open_temp().await;
        let mut custom = ModelInfo::new("Vendor/Thinker-9B", ModelType::Reasoning);
        custom.strategy = Some(3);
        store.save_model(&custom).await.unwrap();
        store
            .save_model(&ModelInfo::new("Vendor/Retired", ModelType::Chat))
            .await
            .unwrap();

        assert!(store.record_model_call("Vendor/Thinker-9B").await.unwrap());
        assert!(store.record_model_call("Vendor/Thinker-9B").await.unwrap());
        assert!(!store.record_model_call("Vendor/Unknown").await.unwrap());

        let synced = store
            .sync_models(&["Vendor/Thinker-9B".to_string(), "Qwen/QwQ-32B".to_string()])
            .await
            .unwrap();
        assert_eq!(synced, 2);

        let thinker = store.find_model("Vendor/Thinker-9B").await.unwrap().unwrap();
        assert_eq!(thinker.model_type, ModelType::Reasoning);
        assert_eq!(thinker.strategy, Some(3));
        assert_eq!(thinker.call_count, 2);

        let qwq = store.find_model("Qwen/QwQ-32B").await.unwrap().unwrap();
        assert!(qwq.is_reasoning());
        assert!(qwq.is_giftable);

        assert!(store.find_model("Vendor/Retired").await.unwrap().is_none());
        assert!(!store.record_model_call("Vendor/Retired").await.unwrap());

        let listed: Vec<String> = store
            .list_models()
            .await
            .unwrap()
            .into_iter()
            .map(|model| model.id)
            .collect();
        assert_eq!(listed, vec!["Vendor/Thinker-9B", "Qwen/QwQ-32B"]);
    }
}
