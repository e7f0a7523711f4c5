//! Model identifiers and complexity tiers.
//!
//! Every model the sidecar touches is named `<provider>/<name>`. Ids whose
//! provider segment is `slimclaw` are *virtual*: they never reach an upstream
//! and are resolved at request time by the routing pipeline. Phase 1 defines a
//! single virtual model, `slimclaw/auto`.

use serde::{Deserialize, Serialize};

/// The virtual provider prefix.
pub const VIRTUAL_PROVIDER: &str = "slimclaw";

/// The only virtual model defined in phase 1.
pub const VIRTUAL_AUTO: &str = "slimclaw/auto";

/// Assumed request complexity, ordered cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Simple,
    Mid,
    Complex,
    Reasoning,
}

impl Tier {
    /// All tiers, cheapest first. Iteration order matches `rank()`.
    pub const ALL: [Tier; 4] = [Tier::Simple, Tier::Mid, Tier::Complex, Tier::Reasoning];

    /// Fixed rank 1..4. Ordering defines downgrade/upgrade direction.
    pub fn rank(self) -> u8 {
        match self {
            Self::Simple => 1,
            Self::Mid => 2,
            Self::Complex => 3,
            Self::Reasoning => 4,
        }
    }

    /// Tiers strictly below this one, highest first — the order a budget
    /// downgrade walks them.
    pub fn below(self) -> impl Iterator<Item = Tier> {
        let rank = self.rank();
        Self::ALL.into_iter().rev().filter(move |t| t.rank() < rank)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Mid => "mid",
            Self::Complex => "complex",
            Self::Reasoning => "reasoning",
        })
    }
}

/// A parsed `<provider>/<name>` model identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelId {
    pub provider: String,
    pub name: String,
}

impl ModelId {
    /// `true` iff this id belongs to the sidecar's virtual provider.
    pub fn is_virtual(&self) -> bool {
        self.provider == VIRTUAL_PROVIDER
    }
}

/// Error returned when a model id is not `<provider>/<name>`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid model ID format: {0}")]
pub struct InvalidModelId(pub String);

/// Split a model id into provider and name halves.
///
/// Fails on a missing `/`, an empty provider, or an empty name. Extra slashes
/// belong to the name (`openai/ft:gpt-4o/suffix` is valid).
pub fn parse_virtual_model_id(id: &str) -> Result<ModelId, InvalidModelId> {
    match id.split_once('/') {
        Some((provider, name)) if !provider.is_empty() && !name.is_empty() => Ok(ModelId {
            provider: provider.to_string(),
            name: name.to_string(),
        }),
        _ => Err(InvalidModelId(id.to_string())),
    }
}

/// Built-in tier → model map, used when `routing.tiers` leaves a tier unset.
pub fn default_tier_model(tier: Tier) -> &'static str {
    match tier {
        Tier::Simple => "anthropic/claude-3-haiku-20240307",
        Tier::Mid => "anthropic/claude-3-5-sonnet-20241022",
        Tier::Complex => "anthropic/claude-3-opus-20240229",
        Tier::Reasoning => "openai/o1",
    }
}

/// Reverse-map a model string to the tier it most likely belongs to.
///
/// Case-insensitive substring heuristics, checked in priority order:
/// reasoning markers, then simple, then mid, then complex. Unknown models
/// fall back to `complex` — over-provisioning is the safe direction.
pub fn infer_tier_from_model(model: &str) -> Tier {
    let m = model.to_lowercase();
    let has = |needle: &str| m.contains(needle);

    const REASONING: &[&str] = &["o1", "o3", "o4-mini", "deepseek-r1", "gemini-2.5-pro"];
    const SIMPLE: &[&str] = &[
        "haiku",
        "gpt-4.1-nano",
        "gpt-4o-mini",
        "nano",
        "deepseek-v3",
        "gpt-3.5",
    ];
    const MID: &[&str] = &["sonnet", "gpt-4.1-mini", "flash", "llama-4-maverick", "qwen3-coder"];

    if REASONING.iter().any(|n| has(n)) {
        return Tier::Reasoning;
    }
    if SIMPLE.iter().any(|n| has(n)) {
        return Tier::Simple;
    }
    if MID.iter().any(|n| has(n)) {
        return Tier::Mid;
    }
    // Complex markers (opus, gpt-4.1 without nano/mini, gpt-4, llama-405b)
    // need no explicit check: everything unmatched lands on complex anyway.
    Tier::Complex
}
