//! 多维加权评分：余额、成功率、RPM、TPM。

use crate::{config::Settings, keys::KeyRecord};

/// 独立评分路径使用的固定 RPM 上限。
pub const FIXED_RPM_CEILING: f64 = 100.0;
/// 独立评分路径使用的固定 TPM 上限。
pub const FIXED_TPM_CEILING: f64 = 5000.0;

/// 归一化后的四项权重，总和为 1。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub balance: f64,
    pub success_rate: f64,
    pub rpm: f64,
    pub tpm: f64,
}

impl ScoreWeights {
    pub fn from_settings(settings: &Settings) -> Self {
        let pool = &settings.pool;
        Self {
            balance: positive_or(pool.balance_weight, 0.4),
            success_rate: positive_or(pool.success_rate_weight, 0.3),
            rpm: positive_or(pool.rpm_weight, 0.15),
            tpm: positive_or(pool.tpm_weight, 0.15),
        }
        .normalized()
    }

    pub fn normalized(self) -> Self {
        let sum = self.balance + self.success_rate + self.rpm + self.tpm;
        if sum <= 0.0 || (sum - 1.0).abs() < f64::EPSILON {
            return self;
        }
        Self {
            balance: self.balance / sum,
            success_rate: self.success_rate / sum,
            rpm: self.rpm / sum,
            tpm: self.tpm / sum,
        }
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value > 0.0 { value } else { fallback }
}

/// 各维度的归一化上限。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ceilings {
    pub balance: f64,
    pub rpm: f64,
    pub tpm: f64,
}

impl Ceilings {
    /// 独立评分：余额用 max_balance_display，RPM/TPM 用固定常量。
    pub fn fixed(settings: &Settings) -> Self {
        Self {
            balance: settings.pool.max_balance_display,
            rpm: FIXED_RPM_CEILING,
            tpm: FIXED_TPM_CEILING,
        }
    }

    /// 优先级排序：RPM/TPM 取当前可用 key 的观测最大值，0 视为 1。
    pub fn observed(records: &[KeyRecord], settings: &Settings) -> Self {
        let threshold = settings.pool.min_balance_threshold;
        let (max_rpm, max_tpm) = records
            .iter()
            .filter(|record| record.is_eligible(threshold))
            .fold((0u64, 0u64), |(rpm, tpm), record| {
                (rpm.max(record.rpm), tpm.max(record.tpm))
            });
        Self {
            balance: settings.pool.max_balance_display,
            rpm: if max_rpm == 0 { 1.0 } else { max_rpm as f64 },
            tpm: if max_tpm == 0 { 1.0 } else { max_tpm as f64 },
        }
    }
}

/// 计算单个 key 的综合得分，范围 [0, 1]。禁用的 key 恒为 0。
pub fn score(record: &KeyRecord, weights: &ScoreWeights, ceilings: &Ceilings) -> f64 {
    if record.disabled {
        return 0.0;
    }

    let balance_ratio = if ceilings.balance > 0.0 {
        (record.balance / ceilings.balance).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let balance = balance_ratio * weights.balance;

    let success = if record.total_calls > 0 {
        record.success_rate.clamp(0.0, 1.0) * weights.success_rate
    } else {
        weights.success_rate
    };

    let rpm = load_component(record.rpm, ceilings.rpm) * weights.rpm;
    let tpm = load_component(record.tpm, ceilings.tpm) * weights.tpm;

    (balance + success + rpm + tpm).clamp(0.0, 1.0)
}

fn load_component(value: u64, ceiling: f64) -> f64 {
    if value == 0 {
        return 1.0;
    }
    if ceiling <= 0.0 {
        return 0.0;
    }
    (1.0 - value as f64 / ceiling).max(0.0)
}

/// 独立评分路径，结果缓存在 KeyRecord::score。
pub fn standalone_score(record: &KeyRecord, settings: &Settings) -> f64 {
    score(
        record,
        &ScoreWeights::from_settings(settings),
        &Ceilings::fixed(settings),
    )
}

/// 优先级评分路径，返回与 records 一一对应的分数。
pub fn priority_scores(records: &[KeyRecord], settings: &Settings) -> Vec<f64> {
    let weights = ScoreWeights::from_settings(settings);
    let ceilings = Ceilings::observed(records, settings);
    records
        .iter()
        .map(|record| score(record, &weights, &ceilings))
        .collect()
}

/// 可用 key 按优先级分降序（稳定）在前，其后是禁用的 key，最后是余额不足的 key。
pub fn sort_by_priority(records: &mut Vec<KeyRecord>, settings: &Settings) {
    let threshold = settings.pool.min_balance_threshold;
    let scores = priority_scores(records, settings);

    let mut active = Vec::new();
    let mut disabled = Vec::new();
    let mut low_balance = Vec::new();
    for (record, score) in records.drain(..).zip(scores) {
        if record.is_eligible(threshold) {
            active.push((score, record));
        } else if record.disabled || record.deleted {
            disabled.push(record);
        } else {
            low_balance.push(record);
        }
    }

    active.sort_by(|(a, _), (b, _)| b.total_cmp(a));
    records.extend(active.into_iter().map(|(_, record)| record));
    records.extend(disabled);
    records.extend(low_balance);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, balance: f64) -> KeyRecord {
        KeyRecord::new(key, balance, 0.8, 0)
    }

    fn fixed(settings: &Settings) -> (ScoreWeights, Ceilings) {
        (ScoreWeights::from_settings(settings), Ceilings::fixed(settings))
    }

    #[test]
    fn fresh_key_with_full_balance_scores_one() {
        let settings = Settings::default();
        let (weights, ceilings) = fixed(&settings);
        let key = record("sk-a", 14.0);
        assert!((score(&key, &weights, &ceilings) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_path_uses_constant_ceilings() {
        let settings = Settings::default();
        let (weights, ceilings) = fixed(&settings);
        let mut key = record("sk-a", 7.0);
        key.total_calls = 10;
        key.success_calls = 8;
        key.success_rate = 0.8;
        key.rpm = 50;
        key.tpm = 2500;

        // 0.5*0.4 + 0.8*0.3 + 0.5*0.15 + 0.5*0.15
        let expected = 0.2 + 0.24 + 0.075 + 0.075;
        assert!((score(&key, &weights, &ceilings) - expected).abs() < 1e-9);
    }

    #[test]
    fn observed_path_uses_max_of_active_keys() {
        let settings = Settings::default();
        let mut busy = record("sk-busy", 14.0);
        busy.rpm = 20;
        busy.tpm = 400;
        let mut calm = record("sk-calm", 14.0);
        calm.rpm = 10;
        calm.tpm = 100;
        let mut disabled = record("sk-off", 14.0);
        disabled.disabled = true;
        disabled.rpm = 1000;

        let records = vec![busy, calm, disabled];
        let ceilings = Ceilings::observed(&records, &settings);
        assert_eq!(ceilings.rpm, 20.0);
        assert_eq!(ceilings.tpm, 400.0);

        let scores = priority_scores(&records, &settings);
        // 忙碌 key 的 RPM/TPM 分量归零
        assert!((scores[0] - 0.7).abs() < 1e-9);
        // 0.4 + 0.3 + 0.5*0.15 + 0.75*0.15
        assert!((scores[1] - 0.8875).abs() < 1e-9);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn observed_path_treats_idle_pool_as_ceiling_one() {
        let settings = Settings::default();
        let records = vec![record("sk-a", 1.0)];
        let ceilings = Ceilings::observed(&records, &settings);
        assert_eq!(ceilings.rpm, 1.0);
        assert_eq!(ceilings.tpm, 1.0);
    }

    #[test]
    fn disabled_key_scores_zero() {
        let settings = Settings::default();
        let (weights, ceilings) = fixed(&settings);
        let mut key = record("sk-a", 14.0);
        key.disabled = true;
        assert_eq!(score(&key, &weights, &ceilings), 0.0);
    }

    #[test]
    fn weights_are_renormalized() {
        let mut settings = Settings::default();
        settings.pool.balance_weight = 2.0;
        settings.pool.success_rate_weight = 1.0;
        settings.pool.rpm_weight = 0.5;
        settings.pool.tpm_weight = 0.5;
        let weights = ScoreWeights::from_settings(&settings);
        assert!((weights.balance - 0.5).abs() < 1e-9);
        assert!((weights.success_rate - 0.25).abs() < 1e-9);
        let sum = weights.balance + weights.success_rate + weights.rpm + weights.tpm;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_is_monotonic_in_each_dimension() {
        let settings = Settings::default();
        let (weights, ceilings) = fixed(&settings);
        let mut base = record("sk-a", 3.0);
        base.total_calls = 10;
        base.success_rate = 0.5;
        base.rpm = 10;
        base.tpm = 1000;

        let mut last = -1.0;
        for balance in [0.0, 1.0, 3.0, 10.0, 14.0, 30.0] {
            let mut key = base.clone();
            key.balance = balance;
            let value = score(&key, &weights, &ceilings);
            assert!(value >= last);
            last = value;
        }

        let mut last = -1.0;
        for rate in [0.0, 0.25, 0.5, 0.9, 1.0] {
            let mut key = base.clone();
            key.success_rate = rate;
            let value = score(&key, &weights, &ceilings);
            assert!(value >= last);
            last = value;
        }

        let mut last = 2.0;
        for rpm in [0, 1, 10, 50, 100, 500] {
            let mut key = base.clone();
            key.rpm = rpm;
            let value = score(&key, &weights, &ceilings);
            assert!(value <= last);
            last = value;
        }

        let mut last = 2.0;
        for tpm in [0, 100, 2500, 5000, 9000] {
            let mut key = base.clone();
            key.tpm = tpm;
            let value = score(&key, &weights, &ceilings);
            assert!(value <= last);
            last = value;
        }
    }

    #[test]
    fn score_is_deterministic() {
        let settings = Settings::default();
        let (weights, ceilings) = fixed(&settings);
        let mut key = record("sk-a", 5.5);
        key.rpm = 3;
        let first = score(&key, &weights, &ceilings);
        for _ in 0..10 {
            assert_eq!(score(&key, &weights, &ceilings), first);
        }
    }

    #[test]
    fn sort_places_active_first_then_disabled_then_low_balance() {
        let settings = Settings::default();
        let mut disabled = record("sk-disabled", 10.0);
        disabled.disabled = true;
        let mut low = record("sk-low", 0.5);
        low.disabled = false;
        let rich = record("sk-rich", 14.0);
        let poor = record("sk-poor", 2.0);
        let tie_a = record("sk-tie-a", 7.0);
        let tie_b = record("sk-tie-b", 7.0);

        let mut records = vec![disabled, low, poor, tie_a, rich, tie_b];
        sort_by_priority(&mut records, &settings);

        let order: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(
            order,
            vec!["sk-rich", "sk-tie-a", "sk-tie-b", "sk-poor", "sk-disabled", "sk-low"]
        );
    }
}
