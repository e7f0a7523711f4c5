//! Configuration types for the slimclaw sidecar.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens its port. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [sidecar]
//! port = 8484
//!
//! [routing]
//! enabled = true
//!
//! [routing.tiers]
//! simple = "anthropic/claude-3-haiku-20240307"
//!
//! [provider_credentials.anthropic]
//! base_url = "https://api.anthropic.com"
//! api_key_env = "ANTHROPIC_API_KEY"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::abtest::{Experiment, ExperimentStatus};
use crate::models::{self, parse_virtual_model_id, Tier};
use crate::pricing::Pricing;

/// Top-level sidecar configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub sidecar: SidecarConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    /// Per-provider upstream endpoints and credentials, keyed by provider id
    /// (`anthropic`, `openai`, `openrouter`, …).
    #[serde(default)]
    pub provider_credentials: HashMap<String, ProviderCredentials>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.routing.min_confidence),
            "routing.min_confidence must be within [0, 1], got {}",
            self.routing.min_confidence
        );
        anyhow::ensure!(
            self.routing.budget.alert_threshold_percent > 0.0
                && self.routing.budget.alert_threshold_percent <= 100.0,
            "routing.budget.alert_threshold_percent must be within (0, 100], got {}",
            self.routing.budget.alert_threshold_percent
        );

        // Every explicit tier mapping must be a well-formed, concrete model id
        for (tier, model) in &self.routing.tiers {
            let id = parse_virtual_model_id(model)
                .with_context(|| format!("routing.tiers.{tier}"))?;
            anyhow::ensure!(
                !id.is_virtual(),
                "routing.tiers.{tier} maps to virtual model `{model}`"
            );
        }

        for exp in &self.routing.ab_testing.experiments {
            for variant in &exp.variants {
                parse_virtual_model_id(&variant.model).with_context(|| {
                    format!("experiment `{}` variant `{}`", exp.id, variant.id)
                })?;
            }
            if exp.status == ExperimentStatus::Active {
                anyhow::ensure!(
                    exp.variants.iter().any(|v| v.weight > 0),
                    "experiment `{}` is active but has no variant with positive weight",
                    exp.id
                );
            }
        }

        for pattern in self.routing.tier_providers.keys() {
            anyhow::ensure!(
                !pattern.is_empty(),
                "routing.tier_providers contains an empty pattern"
            );
        }
        for pattern in &self.routing.pinned_models {
            anyhow::ensure!(!pattern.is_empty(), "routing.pinned_models contains an empty pattern");
        }

        Ok(())
    }
}

/// Core sidecar settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SidecarConfig {
    /// Listen port (default: 8484).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Per-request upstream timeout in milliseconds (default: 120 000).
    ///
    /// Bounds the time until upstream response headers arrive; the streamed
    /// body is not subject to it.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Where the budget counter snapshot is persisted. Leave unset to keep
    /// budget counters purely in memory.
    #[serde(default)]
    pub budget_snapshot_path: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            timeout_ms: defaults::timeout_ms(),
            budget_snapshot_path: None,
        }
    }
}

/// Routing pipeline settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Master switch. When false no request is rewritten, but shadow
    /// recommendations are still emitted.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Classifications below this confidence keep the original model
    /// (default: 0.4).
    #[serde(default = "defaults::min_confidence")]
    pub min_confidence: f64,

    /// Tier → model map. Tiers absent here use the built-in defaults.
    #[serde(default)]
    pub tiers: HashMap<Tier, String>,

    /// Model pattern → provider id. Patterns are exact ids or `prefix/*`
    /// globs. Exact matches win; glob matches apply in sorted pattern order.
    #[serde(default)]
    pub tier_providers: HashMap<String, String>,

    /// Patterns whose original model is preserved (never rerouted).
    #[serde(default)]
    pub pinned_models: Vec<String>,

    /// Thinking budget attached when the final tier is `reasoning`
    /// (default: 10 000).
    #[serde(default)]
    pub reasoning_budget: Option<u32>,

    #[serde(default)]
    pub open_router_headers: OpenRouterHeaders,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub ab_testing: AbTestingConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            min_confidence: defaults::min_confidence(),
            tiers: HashMap::new(),
            tier_providers: HashMap::new(),
            pinned_models: Vec::new(),
            reasoning_budget: None,
            open_router_headers: OpenRouterHeaders::default(),
            budget: BudgetConfig::default(),
            ab_testing: AbTestingConfig::default(),
        }
    }
}

impl RoutingConfig {
    /// The model serving `tier`: the configured mapping, or the built-in
    /// default when the tier is unmapped.
    pub fn tier_model(&self, tier: Tier) -> String {
        self.tiers
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| models::default_tier_model(tier).to_string())
    }

    /// Resolve the provider serving `model`. An exact `tier_providers` key
    /// wins; then glob patterns in sorted order; finally the id's own
    /// `<provider>/` prefix.
    pub fn resolve_provider(&self, model: &str) -> String {
        if let Some(provider) = self.tier_providers.get(model) {
            return provider.clone();
        }
        let mut globs: Vec<(&String, &String)> = self
            .tier_providers
            .iter()
            .filter(|(pattern, _)| pattern.ends_with("/*"))
            .collect();
        globs.sort_by_key(|(pattern, _)| pattern.as_str());
        for (pattern, provider) in globs {
            if pattern_matches(pattern, model) {
                return provider.clone();
            }
        }
        model
            .split_once('/')
            .map(|(provider, _)| provider.to_string())
            .unwrap_or_default()
    }

    /// Whether any pinning pattern preserves `model`.
    pub fn is_pinned(&self, model: &str) -> bool {
        self.pinned_models.iter().any(|p| pattern_matches(p, model))
    }
}

/// Exact id, or `prefix/*` matching every model under that prefix.
pub fn pattern_matches(pattern: &str, model: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        model
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
    } else {
        pattern == model
    }
}

/// Attribution headers injected for the `openrouter` provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenRouterHeaders {
    #[serde(default = "defaults::x_title")]
    pub x_title: String,
    #[serde(default = "defaults::http_referer")]
    pub http_referer: String,
}

impl Default for OpenRouterHeaders {
    fn default() -> Self {
        Self {
            x_title: defaults::x_title(),
            http_referer: defaults::http_referer(),
        }
    }
}

/// Cost envelope settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Daily USD limits per tier.
    #[serde(default)]
    pub daily: HashMap<Tier, f64>,

    /// Weekly USD limits per tier.
    #[serde(default)]
    pub weekly: HashMap<Tier, f64>,

    /// Percentage of a window's limit at which `alert_triggered` fires
    /// (default: 80).
    #[serde(default = "defaults::alert_threshold_percent")]
    pub alert_threshold_percent: f64,

    #[serde(default)]
    pub enforcement_action: EnforcementAction,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily: HashMap::new(),
            weekly: HashMap::new(),
            alert_threshold_percent: defaults::alert_threshold_percent(),
            enforcement_action: EnforcementAction::default(),
        }
    }
}

/// What happens when a tier's budget is exhausted.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementAction {
    /// Keep routing; only flag the overage.
    #[default]
    AlertOnly,
    /// Refuse the request (HTTP 429).
    Block,
    /// Route to the highest still-affordable lower tier; block when none.
    Downgrade,
}

impl std::fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AlertOnly => "alert-only",
            Self::Block => "block",
            Self::Downgrade => "downgrade",
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AbTestingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

/// Where and how to reach one provider.
///
/// The API key value is read from the environment variable named by
/// `api_key_env` at startup, keeping secrets out of the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderCredentials {
    /// Base URL without the `/v1/...` suffix (added by the forwarder).
    pub base_url: String,

    /// Environment variable holding the Bearer token. Leave unset for
    /// keyless local providers.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderCredentials {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Dynamic pricing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    /// Models listing endpoint to refresh rates from. Unset disables the
    /// dynamic cache.
    #[serde(default)]
    pub refresh_url: Option<String>,

    /// How long fetched rates stay fresh (default: 3600 s).
    #[serde(default = "defaults::refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,

    /// Operator-supplied rates that override every other source.
    #[serde(default)]
    pub custom: HashMap<String, Pricing>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            refresh_url: None,
            refresh_ttl_secs: defaults::refresh_ttl_secs(),
            custom: HashMap::new(),
        }
    }
}

mod defaults {
    pub fn port() -> u16 { 8484 }
    pub fn timeout_ms() -> u64 { 120_000 }
    pub fn enabled() -> bool { true }
    pub fn min_confidence() -> f64 { 0.4 }
    pub fn alert_threshold_percent() -> f64 { 80.0 }
    pub fn refresh_ttl_secs() -> u64 { 3_600 }
    pub fn x_title() -> String { "SlimClaw".into() }
    pub fn http_referer() -> String { "slimclaw".into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [sidecar]
            port = 8484

            [routing.tiers]
            simple = "anthropic/claude-3-haiku-20240307"
            reasoning = "openai/o1"

            [routing.tier_providers]
            "openrouter/*" = "openrouter"

            [provider_credentials.anthropic]
            base_url = "https://api.anthropic.com"
            api_key_env = "ANTHROPIC_API_KEY"
            "#,
        )
        .expect("minimal config should parse")
    }

    // -----------------------------------------------------------------------
    // Parsing & validation
    // -----------------------------------------------------------------------

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.sidecar.port, 8484);
        assert_eq!(config.sidecar.timeout_ms, 120_000);
        assert!(config.routing.enabled);
        assert_eq!(config.routing.min_confidence, 0.4);
        assert_eq!(config.routing.budget.alert_threshold_percent, 80.0);
        assert_eq!(
            config.routing.budget.enforcement_action,
            EnforcementAction::AlertOnly
        );
        assert_eq!(config.routing.open_router_headers.x_title, "SlimClaw");
        assert_eq!(config.routing.open_router_headers.http_referer, "slimclaw");
    }

    #[test]
    fn validation_rejects_out_of_range_min_confidence() {
        let mut config = minimal_config();
        config.routing.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_malformed_tier_model() {
        let mut config = minimal_config();
        config.routing.tiers.insert(Tier::Mid, "no-slash".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_virtual_tier_model() {
        let mut config = minimal_config();
        config.routing.tiers.insert(Tier::Mid, "slimclaw/auto".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_alert_threshold() {
        let mut config = minimal_config();
        config.routing.budget.alert_threshold_percent = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn enforcement_action_parses_kebab_case() {
        let cfg: BudgetConfig =
            toml::from_str("enforcement_action = \"alert-only\"").unwrap();
        assert_eq!(cfg.enforcement_action, EnforcementAction::AlertOnly);
        let cfg: BudgetConfig = toml::from_str("enforcement_action = \"downgrade\"").unwrap();
        assert_eq!(cfg.enforcement_action, EnforcementAction::Downgrade);
    }

    #[test]
    fn active_experiment_without_weight_fails_validation() {
        let config: Config = toml::from_str(
            r#"
            [[routing.ab_testing.experiments]]
            id = "exp-1"
            tier = "simple"
            status = "active"
            started_at = "2026-01-01T00:00:00Z"
            variants = [{ id = "a", model = "test/model-a", weight = 0 }]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    // -----------------------------------------------------------------------
    // Tier model resolution
    // -----------------------------------------------------------------------

    #[test]
    fn tier_model_prefers_configured_mapping() {
        let config = minimal_config();
        assert_eq!(
            config.routing.tier_model(Tier::Simple),
            "anthropic/claude-3-haiku-20240307"
        );
    }

    #[test]
    fn tier_model_falls_back_to_builtin_default() {
        let config = minimal_config();
        assert_eq!(
            config.routing.tier_model(Tier::Mid),
            "anthropic/claude-3-5-sonnet-20241022"
        );
    }

    // -----------------------------------------------------------------------
    // Provider resolution
    // -----------------------------------------------------------------------

    #[test]
    fn provider_resolves_via_glob_pattern() {
        let config = minimal_config();
        assert_eq!(
            config.routing.resolve_provider("openrouter/meta/llama-4-maverick"),
            "openrouter"
        );
    }

    #[test]
    fn provider_exact_key_beats_glob() {
        let mut config = minimal_config();
        config
            .routing
            .tier_providers
            .insert("openrouter/special".into(), "special-gateway".into());
        assert_eq!(
            config.routing.resolve_provider("openrouter/special"),
            "special-gateway"
        );
    }

    #[test]
    fn provider_falls_back_to_id_prefix() {
        let config = minimal_config();
        assert_eq!(
            config.routing.resolve_provider("anthropic/claude-3-opus-20240229"),
            "anthropic"
        );
    }

    #[test]
    fn pattern_matching_rules() {
        assert!(pattern_matches("openai/gpt-4o", "openai/gpt-4o"));
        assert!(pattern_matches("openai/*", "openai/gpt-4o"));
        assert!(!pattern_matches("openai/*", "openai2/gpt-4o"));
        assert!(!pattern_matches("openai/*", "openai"));
        assert!(!pattern_matches("openai/gpt-4o", "openai/gpt-4o-mini"));
    }

    #[test]
    fn pinned_models_match_exact_and_glob() {
        let mut config = minimal_config();
        config.routing.pinned_models = vec!["mycorp/*".into(), "openai/gpt-4o-audio".into()];
        assert!(config.routing.is_pinned("mycorp/private-model"));
        assert!(config.routing.is_pinned("openai/gpt-4o-audio"));
        assert!(!config.routing.is_pinned("openai/gpt-4o"));
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    #[test]
    fn api_key_resolves_from_env_var() {
        let var = "SLIMCLAW_CONFIG_TEST_KEY_RESOLVE";
        // SAFETY: single-threaded test setup; env mutation is acceptable here.
        unsafe { std::env::set_var(var, "sk-test-resolved") };
        let creds = ProviderCredentials {
            base_url: "https://api.example.com".into(),
            api_key_env: Some(var.into()),
        };
        assert_eq!(creds.api_key().as_deref(), Some("sk-test-resolved"));
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn api_key_is_none_when_unset_or_empty() {
        let creds = ProviderCredentials {
            base_url: "https://api.example.com".into(),
            api_key_env: Some("SLIMCLAW_CONFIG_TEST_DEFINITELY_NOT_SET".into()),
        };
        assert!(creds.api_key().is_none());

        let keyless = ProviderCredentials {
            base_url: "http://localhost:11434".into(),
            api_key_env: None,
        };
        assert!(keyless.api_key().is_none());
    }
}
