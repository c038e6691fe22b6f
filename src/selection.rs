use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    classify::RequestKind,
    config::Settings,
    error::ProxyError,
    keys::{KeyRecord, mask_key},
    scoring,
};

/// 超过该估算 token 数的请求优先使用高余额 key。
pub const LARGE_REQUEST_TOKENS: usize = 5000;

/// 全局 key 使用模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    #[default]
    All,
    Single,
    Selected,
}

impl KeyMode {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(KeyMode::All),
            "single" => Ok(KeyMode::Single),
            "selected" => Ok(KeyMode::Selected),
            other => Err(ProxyError::InvalidKeyMode(format!("unknown mode '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyMode::All => "all",
            KeyMode::Single => "single",
            KeyMode::Selected => "selected",
        }
    }
}

/// 当前模式、固定的 key 集合以及轮询游标。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyModeState {
    pub mode: KeyMode,
    pub keys: Vec<String>,
    #[serde(skip)]
    cursor: usize,
}

/// 可按模型配置的选 key 策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    HighSuccessRate,
    HighScore,
    LowRpm,
    LowTpm,
    HighBalance,
    RoundRobin,
    LowBalance,
}

impl Strategy {
    /// 未知 id 回落到轮询。
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => Strategy::HighSuccessRate,
            2 => Strategy::HighScore,
            3 => Strategy::LowRpm,
            4 => Strategy::LowTpm,
            5 => Strategy::HighBalance,
            7 => Strategy::LowBalance,
            _ => Strategy::RoundRobin,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Strategy::HighSuccessRate => 1,
            Strategy::HighScore => 2,
            Strategy::LowRpm => 3,
            Strategy::LowTpm => 4,
            Strategy::HighBalance => 5,
            Strategy::RoundRobin => 6,
            Strategy::LowBalance => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::HighSuccessRate => "high_success_rate",
            Strategy::HighScore => "high_score",
            Strategy::LowRpm => "low_rpm",
            Strategy::LowTpm => "low_tpm",
            Strategy::HighBalance => "high_balance",
            Strategy::RoundRobin => "round_robin",
            Strategy::LowBalance => "low_balance",
        }
    }
}

/// 单次请求的选择上下文。
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionContext {
    pub kind: RequestKind,
    pub model: Option<String>,
    pub estimated_tokens: usize,
    /// 模型登记表里为该模型设置的策略，配置中的映射优先。
    pub registered_strategy: Option<Strategy>,
}

impl SelectionContext {
    pub fn new(kind: RequestKind, model: Option<String>, estimated_tokens: usize) -> Self {
        Self {
            kind,
            model,
            estimated_tokens,
            registered_strategy: None,
        }
    }

    pub fn with_registered_strategy(mut self, strategy: Option<Strategy>) -> Self {
        self.registered_strategy = strategy;
        self
    }

    fn is_large(&self) -> bool {
        self.estimated_tokens > LARGE_REQUEST_TOKENS || self.kind == RequestKind::LargeCompletion
    }
}

/// 选 key 引擎：持有模式状态与各策略的轮询游标。
#[derive(Debug, Default)]
pub struct Selector {
    mode: Mutex<KeyModeState>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> KeyModeState {
        self.lock_mode().clone()
    }

    /// 切换模式并重置轮询游标。single 需要恰好 1 个 key，selected 至少 2 个。
    pub fn set_mode(&self, mode: KeyMode, keys: Vec<String>) -> Result<(), ProxyError> {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| key.trim().to_owned())
            .filter(|key| !key.is_empty())
            .collect();

        match mode {
            KeyMode::Single if keys.len() != 1 => {
                return Err(ProxyError::InvalidKeyMode(
                    "single mode requires exactly one key".into(),
                ));
            }
            KeyMode::Selected if keys.len() < 2 => {
                return Err(ProxyError::InvalidKeyMode(
                    "selected mode requires at least two keys".into(),
                ));
            }
            _ => {}
        }

        let mut state = self.lock_mode();
        state.mode = mode;
        state.keys = if mode == KeyMode::All { Vec::new() } else { keys };
        state.cursor = 0;
        Ok(())
    }

    /// 按请求上下文选 key。single/selected 模式下固定集合优先，且失败时显式报错。
    pub fn select(
        &self,
        records: &[KeyRecord],
        settings: &Settings,
        ctx: &SelectionContext,
    ) -> Result<String, ProxyError> {
        let mode = self.lock_mode().mode;
        if mode != KeyMode::All {
            return self.next_for_mode(records, settings);
        }

        let strategy = if ctx.is_large() {
            Strategy::HighBalance
        } else if let Some(strategy) = ctx
            .model
            .as_deref()
            .and_then(|model| model_strategy(settings, model))
            .or(ctx.registered_strategy)
        {
            strategy
        } else if ctx.kind == RequestKind::Streaming {
            Strategy::LowRpm
        } else {
            Strategy::HighScore
        };

        debug!(strategy = strategy.name(), kind = ctx.kind.as_str(), "selecting key");
        self.apply_strategy(strategy, records, settings, ctx.model.as_deref())
    }

    /// 只按当前模式选 key，不考虑请求上下文。
    pub fn next_for_mode(
        &self,
        records: &[KeyRecord],
        settings: &Settings,
    ) -> Result<String, ProxyError> {
        let threshold = settings.pool.min_balance_threshold;
        let mut state = self.lock_mode();
        match state.mode {
            KeyMode::All => {
                drop(state);
                optimal(records, settings).ok_or_else(|| {
                    ProxyError::NoEligibleKey("no active keys in the pool".into())
                })
            }
            KeyMode::Single => {
                let Some(pinned) = state.keys.first() else {
                    return Err(ProxyError::NoEligibleKey("no key selected".into()));
                };
                match records.iter().find(|record| &record.key == pinned) {
                    Some(record) if record.disabled || record.deleted => Err(
                        ProxyError::NoEligibleKey("selected key not found or disabled".into()),
                    ),
                    Some(record) if record.balance < threshold => Err(ProxyError::NoEligibleKey(
                        "selected key has insufficient balance".into(),
                    )),
                    Some(record) => Ok(record.key.clone()),
                    None => Err(ProxyError::NoEligibleKey(
                        "selected key not found or disabled".into(),
                    )),
                }
            }
            KeyMode::Selected => {
                let candidates: Vec<String> = state
                    .keys
                    .iter()
                    .filter(|pinned| {
                        records
                            .iter()
                            .any(|record| &record.key == *pinned && record.is_eligible(threshold))
                    })
                    .cloned()
                    .collect();
                if candidates.is_empty() {
                    return Err(ProxyError::NoEligibleKey(
                        "none of the selected keys is available".into(),
                    ));
                }
                if state.cursor >= candidates.len() {
                    state.cursor = 0;
                }
                let chosen = candidates[state.cursor].clone();
                state.cursor += 1;
                Ok(chosen)
            }
        }
    }

    /// 执行具名策略；找不到合适 key 时回落到任意可用 key。
    pub fn apply_strategy(
        &self,
        strategy: Strategy,
        records: &[KeyRecord],
        settings: &Settings,
        model: Option<&str>,
    ) -> Result<String, ProxyError> {
        let threshold = settings.pool.min_balance_threshold;
        let eligible: Vec<&KeyRecord> = records
            .iter()
            .filter(|record| record.is_eligible(threshold))
            .collect();

        let chosen = match strategy {
            Strategy::HighScore => optimal(records, settings),
            Strategy::RoundRobin => self.rotate(strategy.name(), &eligible),
            Strategy::HighSuccessRate => {
                let best = best_by(&eligible, |record| effective_success_rate(record), true);
                let cursor = format!("{}_{}", strategy.name(), model.unwrap_or_default());
                self.rotate(&cursor, &best)
            }
            Strategy::LowRpm => {
                let best = best_by(&eligible, |record| record.rpm as f64, false);
                self.rotate(strategy.name(), &best)
            }
            Strategy::LowTpm => {
                let best = best_by(&eligible, |record| record.tpm as f64, false);
                self.rotate(strategy.name(), &best)
            }
            Strategy::HighBalance => {
                let best = best_by(&eligible, |record| record.balance, true);
                self.rotate(strategy.name(), &best)
            }
            Strategy::LowBalance => {
                let best = best_by(&eligible, |record| record.balance, false);
                self.rotate(strategy.name(), &best)
            }
        };

        chosen
            .or_else(|| any_available(records, threshold))
            .inspect(|key| {
                debug!(strategy = strategy.name(), key = %mask_key(key), "strategy picked key")
            })
            .ok_or_else(|| ProxyError::NoEligibleKey("no active keys in the pool".into()))
    }

    fn rotate(&self, cursor_name: &str, candidates: &[&KeyRecord]) -> Option<String> {
        match candidates {
            [] => None,
            [only] => Some(only.key.clone()),
            _ => {
                let mut cursors = self
                    .cursors
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let index = cursors.entry(cursor_name.to_owned()).or_insert(0);
                if *index >= candidates.len() {
                    *index = 0;
                }
                let chosen = candidates[*index].key.clone();
                *index += 1;
                Some(chosen)
            }
        }
    }

    fn lock_mode(&self) -> MutexGuard<'_, KeyModeState> {
        self.mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 模型对应的策略：先精确匹配，再忽略大小写匹配。
pub fn model_strategy(settings: &Settings, model: &str) -> Option<Strategy> {
    let strategies = &settings.pool.model_key_strategies;
    if let Some(id) = strategies.get(model) {
        return Some(Strategy::from_id(*id));
    }
    strategies
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(model))
        .map(|(_, id)| Strategy::from_id(*id))
}

/// 优先级分最高的可用 key，同分时取存储顺序靠前者。
pub fn optimal(records: &[KeyRecord], settings: &Settings) -> Option<String> {
    let threshold = settings.pool.min_balance_threshold;
    let scores = scoring::priority_scores(records, settings);
    let mut best: Option<(f64, &KeyRecord)> = None;
    for (record, score) in records.iter().zip(scores) {
        if !record.is_eligible(threshold) {
            continue;
        }
        match best {
            Some((best_score, _)) if score <= best_score => {}
            _ => best = Some((score, record)),
        }
    }
    best.map(|(_, record)| record.key.clone())
}

/// 存储顺序中的第一个可用 key。
pub fn any_available(records: &[KeyRecord], threshold: f64) -> Option<String> {
    records
        .iter()
        .find(|record| record.is_eligible(threshold))
        .map(|record| record.key.clone())
}

fn effective_success_rate(record: &KeyRecord) -> f64 {
    if record.total_calls == 0 {
        1.0
    } else {
        record.success_rate
    }
}

/// 收集并列最优的 key，保持存储顺序。
fn best_by<'a, F>(candidates: &[&'a KeyRecord], metric: F, highest: bool) -> Vec<&'a KeyRecord>
where
    F: Fn(&KeyRecord) -> f64,
{
    let mut best: Vec<&'a KeyRecord> = Vec::new();
    let mut best_value = 0.0;
    for record in candidates {
        let value = metric(record);
        let better = match best.first() {
            None => true,
            Some(_) if highest => value > best_value,
            Some(_) => value < best_value,
        };
        if better {
            best.clear();
            best.push(record);
            best_value = value;
        } else if value == best_value {
            best.push(record);
        }
    }
    best
}
