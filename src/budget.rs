//! Per-tier spending tracker with daily and weekly reset boundaries.
//!
//! Counters live behind a single mutex and only move through the tracker's
//! own methods. Every public operation runs an idempotent reset pass first,
//! so `reset_at` is always in the future when a caller observes it. Daily
//! counters zero at the next UTC midnight; weekly counters zero at the next
//! UTC Monday 00:00 (which also zeroes the daily window).
//!
//! Accounting is best-effort local: concurrent writers are eventually
//! consistent within a reset window, and nothing here claims exactly-once
//! billing.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BudgetConfig, EnforcementAction};
use crate::models::Tier;

/// One spending window (daily or weekly).
#[derive(Debug, Clone)]
struct WindowSpend {
    spent: f64,
    /// `None` means this window has no configured limit.
    limit: Option<f64>,
    reset_at: DateTime<Utc>,
}

impl WindowSpend {
    fn fresh(limit: Option<f64>, reset_at: DateTime<Utc>) -> Self {
        Self { spent: 0.0, limit, reset_at }
    }

    fn remaining(&self) -> Option<f64> {
        self.limit.map(|l| l - self.spent)
    }

    fn over(&self) -> bool {
        self.limit.is_some_and(|l| self.spent > l)
    }

    fn alerting(&self, threshold_percent: f64) -> bool {
        match self.limit {
            Some(l) if l > 0.0 => self.spent / l >= threshold_percent / 100.0,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct TierSpending {
    daily: WindowSpend,
    weekly: WindowSpend,
}

/// Outcome of a [`BudgetTracker::check`], attached to routing output and to
/// 429 responses.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    /// `limit − spent` for the daily window; negative when over, absent when
    /// the window has no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_remaining: Option<f64>,
    pub alert_triggered: bool,
    pub enforcement_action: EnforcementAction,
}

impl BudgetCheck {
    fn unrestricted(action: EnforcementAction) -> Self {
        Self {
            allowed: true,
            daily_remaining: None,
            weekly_remaining: None,
            alert_triggered: false,
            enforcement_action: action,
        }
    }
}

/// Persisted counter state — `{tier: {daily: {spent, resetAt}, …}}` with
/// epoch-millisecond timestamps. Limits are not persisted; they come from
/// config on restore.
pub type BudgetSnapshot = HashMap<Tier, TierSnapshot>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub daily: WindowSnapshot,
    pub weekly: WindowSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub spent: f64,
    #[serde(rename = "resetAt")]
    pub reset_at: i64,
}

/// Tracks spending per tier and answers enforcement questions.
pub struct BudgetTracker {
    enabled: bool,
    alert_threshold_percent: f64,
    enforcement: EnforcementAction,
    state: Mutex<HashMap<Tier, TierSpending>>,
}

impl BudgetTracker {
    pub fn new(config: &BudgetConfig) -> Self {
        Self::new_at(config, Utc::now())
    }

    pub fn new_at(config: &BudgetConfig, now: DateTime<Utc>) -> Self {
        let mut state = HashMap::new();
        // Only tiers with at least one configured limit are tracked.
        for tier in Tier::ALL {
            let daily = config.daily.get(&tier).copied();
            let weekly = config.weekly.get(&tier).copied();
            if daily.is_none() && weekly.is_none() {
                continue;
            }
            state.insert(
                tier,
                TierSpending {
                    daily: WindowSpend::fresh(daily, next_utc_midnight(now)),
                    weekly: WindowSpend::fresh(weekly, next_utc_monday(now)),
                },
            );
        }
        Self {
            enabled: config.enabled,
            alert_threshold_percent: config.alert_threshold_percent,
            enforcement: config.enforcement_action,
            state: Mutex::new(state),
        }
    }

    /// Rebuild a tracker from a persisted snapshot. Tiers configured but
    /// missing from the snapshot start from zero with fresh boundaries; an
    /// immediate reset pass clamps stale boundaries forward.
    pub fn from_snapshot(config: &BudgetConfig, snapshot: &BudgetSnapshot) -> Self {
        Self::from_snapshot_at(config, snapshot, Utc::now())
    }

    pub fn from_snapshot_at(
        config: &BudgetConfig,
        snapshot: &BudgetSnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        let tracker = Self::new_at(config, now);
        {
            let mut state = tracker.state.lock().expect("budget lock poisoned");
            for (tier, saved) in snapshot {
                if let Some(spending) = state.get_mut(tier) {
                    spending.daily.spent = saved.daily.spent.max(0.0);
                    spending.daily.reset_at = from_epoch_ms(saved.daily.reset_at);
                    spending.weekly.spent = saved.weekly.spent.max(0.0);
                    spending.weekly.reset_at = from_epoch_ms(saved.weekly.reset_at);
                }
            }
            maybe_reset(&mut state, now);
        }
        tracker
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn enforcement(&self) -> EnforcementAction {
        self.enforcement
    }

    /// Add `amount` to both windows of `tier`. No-op when disabled, the tier
    /// is untracked, or the amount is not positive.
    pub fn record(&self, tier: Tier, amount: f64) {
        self.record_at(tier, amount, Utc::now());
    }

    pub fn record_at(&self, tier: Tier, amount: f64, now: DateTime<Utc>) {
        if !self.enabled || amount <= 0.0 {
            return;
        }
        let mut state = self.state.lock().expect("budget lock poisoned");
        maybe_reset(&mut state, now);
        if let Some(spending) = state.get_mut(&tier) {
            spending.daily.spent += amount;
            spending.weekly.spent += amount;
        }
    }

    /// Answer whether `tier` may route right now under the configured
    /// enforcement mode. Untracked tiers are always allowed.
    pub fn check(&self, tier: Tier) -> BudgetCheck {
        self.check_at(tier, Utc::now())
    }

    pub fn check_at(&self, tier: Tier, now: DateTime<Utc>) -> BudgetCheck {
        let mut state = self.state.lock().expect("budget lock poisoned");
        maybe_reset(&mut state, now);
        let Some(spending) = state.get(&tier) else {
            return BudgetCheck::unrestricted(self.enforcement);
        };

        let alert_triggered = spending.daily.alerting(self.alert_threshold_percent)
            || spending.weekly.alerting(self.alert_threshold_percent);

        let allowed = match self.enforcement {
            EnforcementAction::AlertOnly => true,
            EnforcementAction::Block => !spending.daily.over() && !spending.weekly.over(),
            // Downgrade keys off the daily window; a weekly-only breach still
            // allows this tier (the caller then walks lower tiers anyway).
            EnforcementAction::Downgrade => !spending.daily.over(),
        };

        BudgetCheck {
            allowed,
            daily_remaining: spending.daily.remaining(),
            weekly_remaining: spending.weekly.remaining(),
            alert_triggered,
            enforcement_action: self.enforcement,
        }
    }

    /// Emit the persistable counter state.
    pub fn serialize(&self) -> BudgetSnapshot {
        self.serialize_at(Utc::now())
    }

    pub fn serialize_at(&self, now: DateTime<Utc>) -> BudgetSnapshot {
        let mut state = self.state.lock().expect("budget lock poisoned");
        maybe_reset(&mut state, now);
        state
            .iter()
            .map(|(tier, spending)| {
                (
                    *tier,
                    TierSnapshot {
                        daily: WindowSnapshot {
                            spent: spending.daily.spent,
                            reset_at: spending.daily.reset_at.timestamp_millis(),
                        },
                        weekly: WindowSnapshot {
                            spent: spending.weekly.spent,
                            reset_at: spending.weekly.reset_at.timestamp_millis(),
                        },
                    },
                )
            })
            .collect()
    }
}

/// Read a snapshot file. A missing file is `Ok(None)`; a corrupt one is an
/// error the caller can log and discard.
pub fn load_snapshot(path: &std::path::Path) -> anyhow::Result<Option<BudgetSnapshot>> {
    use anyhow::Context as _;
    match std::fs::read(path) {
        Ok(bytes) => {
            let snapshot = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing budget snapshot {}", path.display()))?;
            Ok(Some(snapshot))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("reading budget snapshot {}", path.display()))),
    }
}

/// Write a snapshot atomically: temp file in the same directory, then rename.
/// A crash mid-write leaves the previous snapshot intact.
pub fn write_snapshot(path: &std::path::Path, snapshot: &BudgetSnapshot) -> anyhow::Result<()> {
    use anyhow::Context as _;
    let bytes = serde_json::to_vec_pretty(snapshot).context("serializing budget snapshot")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

/// Zero any window whose boundary has passed and advance its `reset_at`
/// strictly past `now`. A weekly rollover zeroes the daily window too.
fn maybe_reset(state: &mut HashMap<Tier, TierSpending>, now: DateTime<Utc>) {
    for spending in state.values_mut() {
        if now >= spending.weekly.reset_at {
            spending.weekly.spent = 0.0;
            spending.weekly.reset_at = next_utc_monday(now);
            spending.daily.spent = 0.0;
            spending.daily.reset_at = next_utc_midnight(now);
        }
        if now >= spending.daily.reset_at {
            spending.daily.spent = 0.0;
            spending.daily.reset_at = next_utc_midnight(now);
        }
    }
}

/// The next UTC midnight strictly after `now`.
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let next_day = now.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&next_day.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}

/// The next UTC Monday 00:00 strictly after `now`.
fn next_utc_monday(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_ahead = 7 - i64::from(now.weekday().num_days_from_monday());
    let monday = now.date_naive() + Duration::days(days_ahead);
    Utc.from_utc_datetime(&monday.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}

fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
