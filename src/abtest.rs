//! A/B experiment assignment — deterministic in the run id.
//!
//! The manager is immutable after construction; changing experiments means
//! building a new manager (and, in practice, restarting the sidecar). A run
//! id always lands on the same variant for a given experiment set, so
//! assignments are stable across restarts and comparable across deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Variant {
    pub id: String,
    pub model: String,
    /// Relative weight. Weights need not sum to 100; the bucket space is
    /// their sum over positive entries.
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Experiment {
    pub id: String,
    pub tier: Tier,
    pub variants: Vec<Variant>,
    pub status: ExperimentStatus,
    pub started_at: DateTime<Utc>,
}

impl Experiment {
    fn eligible(&self, tier: Tier, now: DateTime<Utc>) -> bool {
        self.tier == tier && self.status == ExperimentStatus::Active && self.started_at <= now
    }
}

/// An assignment handed back to the routing engine.
#[derive(Debug, Clone, Serialize)]
pub struct AbAssignment {
    pub experiment_id: String,
    pub variant: Variant,
}

/// Holds the experiment set and answers assignment queries.
pub struct AbTestManager {
    experiments: Vec<Experiment>,
}

impl AbTestManager {
    /// Build a manager, rejecting active experiments whose weights cannot
    /// produce an assignment.
    pub fn new(experiments: Vec<Experiment>) -> anyhow::Result<Self> {
        for exp in &experiments {
            if exp.status == ExperimentStatus::Active {
                anyhow::ensure!(
                    exp.variants.iter().any(|v| v.weight > 0),
                    "experiment `{}` is active but has no variant with positive weight",
                    exp.id
                );
            }
        }
        Ok(Self { experiments })
    }

    /// Assign `run_id` to a variant of the first eligible experiment for
    /// `tier`. Returns `None` when no experiment matches.
    pub fn assign(&self, tier: Tier, run_id: &str) -> Option<AbAssignment> {
        self.assign_at(tier, run_id, Utc::now())
    }

    pub fn assign_at(&self, tier: Tier, run_id: &str, now: DateTime<Utc>) -> Option<AbAssignment> {
        let experiment = self.experiments.iter().find(|e| e.eligible(tier, now))?;

        let total: u64 = experiment
            .variants
            .iter()
            .filter(|v| v.weight > 0)
            .map(|v| u64::from(v.weight))
            .sum();
        if total == 0 {
            return None;
        }

        let bucket = u64::from(fnv1a_32(run_id.as_bytes())) % total;

        let mut cumulative = 0u64;
        for variant in experiment.variants.iter().filter(|v| v.weight > 0) {
            cumulative += u64::from(variant.weight);
            if bucket < cumulative {
                return Some(AbAssignment {
                    experiment_id: experiment.id.clone(),
                    variant: variant.clone(),
                });
            }
        }
        None
    }

    pub fn list_experiments(&self) -> &[Experiment] {
        &self.experiments
    }
}

/// FNV-1a, 32-bit. The assignment contract pins this exact function so
/// bucket boundaries line up across implementations.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn variant(id: &str, model: &str, weight: u32) -> Variant {
        Variant { id: id.into(), model: model.into(), weight }
    }

    fn experiment(id: &str, tier: Tier, status: ExperimentStatus, variants: Vec<Variant>) -> Experiment {
        Experiment {
            id: id.into(),
            tier,
            variants,
            status,
            started_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    // -----------------------------------------------------------------------
    // FNV-1a reference vectors
    // -----------------------------------------------------------------------

    #[test]
    fn fnv1a_matches_published_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    #[test]
    fn single_variant_always_wins() {
        let manager = AbTestManager::new(vec![experiment(
            "exp-1",
            Tier::Simple,
            ExperimentStatus::Active,
            vec![variant("a", "test/model-a", 100)],
        )])
        .unwrap();

        for _ in 0..3 {
            let assignment = manager
                .assign_at(Tier::Simple, "deterministic-run-id", now())
                .unwrap();
            assert_eq!(assignment.experiment_id, "exp-1");
            assert_eq!(assignment.variant.model, "test/model-a");
        }
    }

    #[test]
    fn assignment_is_idempotent_per_run_id() {
        let manager = AbTestManager::new(vec![experiment(
            "exp-1",
            Tier::Mid,
            ExperimentStatus::Active,
            vec![
                variant("a", "test/model-a", 30),
                variant("b", "test/model-b", 70),
            ],
        )])
        .unwrap();

        let first = manager.assign_at(Tier::Mid, "run-42", now()).unwrap();
        for _ in 0..10 {
            let again = manager.assign_at(Tier::Mid, "run-42", now()).unwrap();
            assert_eq!(again.variant.id, first.variant.id);
        }
    }

    #[test]
    fn weights_partition_the_bucket_space() {
        let manager = AbTestManager::new(vec![experiment(
            "exp-1",
            Tier::Mid,
            ExperimentStatus::Active,
            vec![
                variant("a", "test/model-a", 1),
                variant("b", "test/model-b", 3),
            ],
        )])
        .unwrap();

        // Every run id must land on some variant; with weight 1:3 both
        // variants show up over a modest id population.
        let mut seen_a = 0;
        let mut seen_b = 0;
        for i in 0..200 {
            let assignment = manager
                .assign_at(Tier::Mid, &format!("run-{i}"), now())
                .unwrap();
            match assignment.variant.id.as_str() {
                "a" => seen_a += 1,
                "b" => seen_b += 1,
                other => panic!("unexpected variant {other}"),
            }
        }
        assert!(seen_a > 0 && seen_b > 0);
        assert!(seen_b > seen_a, "weight 3 should dominate weight 1");
    }

    #[test]
    fn zero_weight_variants_are_never_assigned() {
        let manager = AbTestManager::new(vec![experiment(
            "exp-1",
            Tier::Simple,
            ExperimentStatus::Active,
            vec![
                variant("dead", "test/model-dead", 0),
                variant("live", "test/model-live", 5),
            ],
        )])
        .unwrap();

        for i in 0..50 {
            let assignment = manager
                .assign_at(Tier::Simple, &format!("run-{i}"), now())
                .unwrap();
            assert_eq!(assignment.variant.id, "live");
        }
    }

    // -----------------------------------------------------------------------
    // Eligibility
    // -----------------------------------------------------------------------

    #[test]
    fn non_active_experiments_never_match() {
        for status in [
            ExperimentStatus::Draft,
            ExperimentStatus::Paused,
            ExperimentStatus::Completed,
        ] {
            let manager = AbTestManager::new(vec![experiment(
                "exp-1",
                Tier::Simple,
                status,
                vec![variant("a", "test/model-a", 100)],
            )])
            .unwrap();
            assert!(manager.assign_at(Tier::Simple, "run", now()).is_none());
        }
    }

    #[test]
    fn future_start_time_excludes_experiment() {
        let mut exp = experiment(
            "exp-1",
            Tier::Simple,
            ExperimentStatus::Active,
            vec![variant("a", "test/model-a", 100)],
        );
        exp.started_at = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        let manager = AbTestManager::new(vec![exp]).unwrap();
        assert!(manager.assign_at(Tier::Simple, "run", now()).is_none());
    }

    #[test]
    fn tier_mismatch_returns_none() {
        let manager = AbTestManager::new(vec![experiment(
            "exp-1",
            Tier::Reasoning,
            ExperimentStatus::Active,
            vec![variant("a", "test/model-a", 100)],
        )])
        .unwrap();
        assert!(manager.assign_at(Tier::Simple, "run", now()).is_none());
    }

    #[test]
    fn first_declared_experiment_wins_for_shared_tier() {
        let manager = AbTestManager::new(vec![
            experiment(
                "first",
                Tier::Simple,
                ExperimentStatus::Active,
                vec![variant("a", "test/model-a", 1)],
            ),
            experiment(
                "second",
                Tier::Simple,
                ExperimentStatus::Active,
                vec![variant("b", "test/model-b", 1)],
            ),
        ])
        .unwrap();
        let assignment = manager.assign_at(Tier::Simple, "run", now()).unwrap();
        assert_eq!(assignment.experiment_id, "first");
    }

    // -----------------------------------------------------------------------
    // Construction validation
    // -----------------------------------------------------------------------

    #[test]
    fn active_experiment_without_positive_weight_is_rejected() {
        let result = AbTestManager::new(vec![experiment(
            "exp-1",
            Tier::Simple,
            ExperimentStatus::Active,
            vec![variant("a", "test/model-a", 0)],
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn draft_experiment_without_weights_is_accepted() {
        let result = AbTestManager::new(vec![experiment(
            "exp-1",
            Tier::Simple,
            ExperimentStatus::Draft,
            vec![variant("a", "test/model-a", 0)],
        )]);
        assert!(result.is_ok());
    }
}
