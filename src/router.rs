//! Routing decision engine — the brain of the sidecar.
//!
//! A request classified by [`crate::classifier`] flows through a fixed
//! pipeline:
//!
//! 1. **Override pipeline** — header pin, config pin, master switch,
//!    confidence gate. First match wins and routing is not applied.
//! 2. **A/B assignment** — an active experiment on the classified tier
//!    replaces the tier-mapped model, deterministically in the run id.
//! 3. **Budget enforcement** — `alert-only` annotates, `block` refuses,
//!    `downgrade` walks lower tiers (re-evaluating the A/B assignment at the
//!    downgraded tier, so per-variant budgets stay auditable).
//! 4. **Provider resolution + headers + thinking budget.**
//!
//! Every path — including non-applied ones — emits a
//! [`ShadowRecommendation`], so observability never loses an event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::debug;

use crate::{
    abtest::{AbAssignment, AbTestManager},
    budget::{BudgetCheck, BudgetSnapshot, BudgetTracker},
    classifier::ClassificationResult,
    config::{Config, EnforcementAction, RoutingConfig},
    latency::LatencyTracker,
    models::Tier,
    pricing::{DynamicPricingCache, PricingBook},
    upstream::UpstreamClient,
};

/// Default thinking budget for the reasoning tier.
const DEFAULT_REASONING_BUDGET: u32 = 10_000;

/// Shared application state injected into every request handler via
/// [`axum::extract::State`].
pub struct SidecarState {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: RwLock<Arc<Config>>,
    /// Path to the config file on disk — used by the hot-reload background task.
    pub config_path: PathBuf,
    /// Budget tracker. `None` when `routing.budget.enabled` is false.
    ///
    /// Note: built once at startup. A config hot-reload will NOT rebuild the
    /// tracker; restart required to change limits at runtime.
    pub budget: Option<BudgetTracker>,
    /// A/B manager. `None` when `routing.ab_testing.enabled` is false.
    /// Immutable; changing experiments requires a restart.
    pub ab: Option<AbTestManager>,
    /// Per-model latency sample windows.
    pub latency: LatencyTracker,
    /// Pricing source for cost estimates and shadow savings.
    pub pricing: PricingBook,
    /// One forwarder per configured provider, keyed by provider id.
    pub upstreams: HashMap<String, UpstreamClient>,
    /// Tokenizer for input-cost estimation. `None` if the BPE tables fail to
    /// load; estimation then falls back to a bytes/4 heuristic.
    pub tokenizer: Option<tiktoken_rs::CoreBPE>,
    /// Sidecar start time.
    pub started_at: std::time::Instant,
}

impl SidecarState {
    pub fn new(
        config: Arc<Config>,
        config_path: PathBuf,
        budget_snapshot: Option<BudgetSnapshot>,
    ) -> anyhow::Result<Self> {
        let budget = config.routing.budget.enabled.then(|| match &budget_snapshot {
            Some(snapshot) => BudgetTracker::from_snapshot(&config.routing.budget, snapshot),
            None => BudgetTracker::new(&config.routing.budget),
        });

        let ab = if config.routing.ab_testing.enabled {
            Some(AbTestManager::new(
                config.routing.ab_testing.experiments.clone(),
            )?)
        } else {
            None
        };

        let dynamic = config.pricing.refresh_url.as_ref().map(|_| {
            DynamicPricingCache::new(std::time::Duration::from_secs(
                config.pricing.refresh_ttl_secs,
            ))
        });
        let pricing = PricingBook::new(config.pricing.custom.clone(), dynamic);

        let upstreams = config
            .provider_credentials
            .iter()
            .map(|(provider, creds)| {
                let client = UpstreamClient::new(
                    creds.base_url.clone(),
                    config.sidecar.timeout_ms,
                    creds.api_key(),
                );
                (provider.clone(), client)
            })
            .collect();

        Ok(Self {
            config_lock: RwLock::new(config),
            config_path,
            budget,
            ab,
            latency: LatencyTracker::new(true),
            pricing,
            upstreams,
            tokenizer: tiktoken_rs::cl100k_base().ok(),
            started_at: std::time::Instant::now(),
        })
    }

    /// Returns a snapshot of the current live config.
    ///
    /// The `RwLock` is held only for the duration of `Arc::clone`
    /// (nanoseconds), so callers get a stable reference with no contention
    /// risk.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only from the hot-reload task.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }

    /// The tracker wiring handed to the decision function.
    pub fn services(&self) -> RoutingServices<'_> {
        RoutingServices {
            budget: self.budget.as_ref(),
            ab: self.ab.as_ref(),
            pricing: Some(&self.pricing),
        }
    }
}

/// Optional trackers consulted by [`make_routing_decision`]. The function
/// branches on presence; absent services simply skip their stage.
#[derive(Clone, Copy, Default)]
pub struct RoutingServices<'a> {
    pub budget: Option<&'a BudgetTracker>,
    pub ab: Option<&'a AbTestManager>,
    pub pricing: Option<&'a PricingBook>,
}

/// Per-request inputs the decision needs beyond the classification.
pub struct RequestContext<'a> {
    pub original_model: &'a str,
    /// Value of the `X-Model-Pinned` header, when present.
    pub pinned_header: Option<&'a str>,
}

/// Why the decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingReason {
    Routed,
    RoutingDisabled,
    PinnedHeader,
    PinnedConfig,
    LowConfidence,
}

impl std::fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Routed => "routed",
            Self::RoutingDisabled => "routing-disabled",
            Self::PinnedHeader => "pinned-header",
            Self::PinnedConfig => "pinned-config",
            Self::LowConfidence => "low-confidence",
        })
    }
}

/// Extended-thinking directive attached for the reasoning tier.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Thinking {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub budget_tokens: u32,
}

impl Thinking {
    fn enabled(budget_tokens: u32) -> Self {
        Self { kind: "enabled", budget_tokens }
    }
}

/// What routing *would* do — emitted on every path so a deployment can run
/// with `routing.enabled = false` and still observe the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowRecommendation {
    pub run_id: String,
    pub original_model: String,
    pub recommended_model: String,
    pub recommended_provider: String,
    /// Whether the recommendation would take effect (confidence gate and
    /// budget permitting) once routing is enabled.
    pub would_apply: bool,
    /// Percentage saved by the recommendation, from the pricing book.
    pub estimated_savings: f64,
    pub reason: RoutingReason,
}

/// The decision handed to the forwarder.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingOutput {
    pub model: String,
    pub provider: String,
    pub tier: Tier,
    pub reason: RoutingReason,
    /// `true` iff the request's model was actually rewritten.
    pub applied: bool,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab: Option<AbAssignment>,
    pub shadow: ShadowRecommendation,
}

/// Outcome of the override pipeline: `None` means "apply routing".
struct OverrideOutcome {
    reason: RoutingReason,
    /// Replacement model, for overrides that carry one (header pin).
    model: Option<String>,
}

/// Evaluate the override pipeline in its fixed order; first match wins.
fn evaluate_overrides(
    classification: &ClassificationResult,
    routing: &RoutingConfig,
    ctx: &RequestContext<'_>,
) -> Option<OverrideOutcome> {
    if let Some(pinned) = ctx.pinned_header.filter(|m| !m.is_empty()) {
        return Some(OverrideOutcome {
            reason: RoutingReason::PinnedHeader,
            model: Some(pinned.to_string()),
        });
    }
    if routing.is_pinned(ctx.original_model) {
        return Some(OverrideOutcome { reason: RoutingReason::PinnedConfig, model: None });
    }
    if !routing.enabled {
        return Some(OverrideOutcome { reason: RoutingReason::RoutingDisabled, model: None });
    }
    if classification.confidence < routing.min_confidence {
        return Some(OverrideOutcome { reason: RoutingReason::LowConfidence, model: None });
    }
    None
}

/// Produce the routing decision for one classified request.
pub fn make_routing_decision(
    classification: &ClassificationResult,
    config: &Config,
    ctx: &RequestContext<'_>,
    run_id: &str,
    services: &RoutingServices<'_>,
) -> RoutingOutput {
    let routing = &config.routing;
    let classified_tier = classification.tier;

    // Tier → model selection, with the A/B variant replacing the mapped
    // model when an experiment is live on that tier.
    let select = |tier: Tier| -> (String, Option<AbAssignment>) {
        if let Some(ab) = services.ab {
            if let Some(assignment) = ab.assign(tier, run_id) {
                return (assignment.variant.model.clone(), Some(assignment));
            }
        }
        (routing.tier_model(tier), None)
    };

    let savings = |tier: Tier| -> f64 {
        services
            .pricing
            .map(|p| p.calculate_routing_savings(ctx.original_model, tier))
            .unwrap_or(0.0)
    };

    // ---- stage 1: overrides ----
    if let Some(outcome) = evaluate_overrides(classification, routing, ctx) {
        let model = outcome
            .model
            .unwrap_or_else(|| ctx.original_model.to_string());
        let provider = routing.resolve_provider(&model);
        let (recommended_model, _) = select(classified_tier);
        let recommended_provider = routing.resolve_provider(&recommended_model);
        // With the master switch off the recommendation would still apply
        // once enabled, provided the confidence gate passes.
        let would_apply = outcome.reason == RoutingReason::RoutingDisabled
            && classification.confidence >= routing.min_confidence;

        debug!(reason = %outcome.reason, %model, "routing not applied");

        return RoutingOutput {
            headers: provider_headers(&provider, routing),
            model,
            tier: classified_tier,
            reason: outcome.reason,
            applied: false,
            thinking: None,
            budget: None,
            ab: None,
            shadow: ShadowRecommendation {
                run_id: run_id.to_string(),
                original_model: ctx.original_model.to_string(),
                recommended_model,
                recommended_provider,
                would_apply,
                estimated_savings: savings(classified_tier),
                reason: outcome.reason,
            },
            provider,
        };
    }

    // ---- stage 2: A/B assignment at the classified tier ----
    let (mut model, mut ab_assignment) = select(classified_tier);
    let mut final_tier = classified_tier;
    let mut budget_check: Option<BudgetCheck> = None;

    // ---- stage 3: budget enforcement ----
    if let Some(tracker) = services.budget.filter(|t| t.enabled()) {
        let check = tracker.check(final_tier);
        let blocked = !check.allowed;
        match tracker.enforcement() {
            EnforcementAction::AlertOnly => {
                budget_check = Some(check);
            }
            EnforcementAction::Block if blocked => {
                return blocked_output(classification, routing, ctx, run_id, check, &model, savings(classified_tier));
            }
            EnforcementAction::Downgrade if blocked => {
                let downgraded = final_tier
                    .below()
                    .find(|&lower| tracker.check(lower).allowed);
                match downgraded {
                    Some(lower) => {
                        debug!(from = %final_tier, to = %lower, "budget downgrade");
                        final_tier = lower;
                        // Re-evaluate the A/B assignment at the lower tier
                        let (m, a) = select(lower);
                        model = m;
                        ab_assignment = a;
                        // Surface the failing check that forced the downgrade
                        budget_check = Some(check);
                    }
                    None => {
                        return blocked_output(classification, routing, ctx, run_id, check, &model, savings(classified_tier));
                    }
                }
            }
            EnforcementAction::Block | EnforcementAction::Downgrade => {
                budget_check = Some(check);
            }
        }
    }

    // ---- stage 4: provider, headers, thinking ----
    let provider = routing.resolve_provider(&model);
    let thinking = (final_tier == Tier::Reasoning).then(|| {
        Thinking::enabled(routing.reasoning_budget.unwrap_or(DEFAULT_REASONING_BUDGET))
    });

    debug!(%model, %provider, tier = %final_tier, "routing applied");

    RoutingOutput {
        headers: provider_headers(&provider, routing),
        shadow: ShadowRecommendation {
            run_id: run_id.to_string(),
            original_model: ctx.original_model.to_string(),
            recommended_model: model.clone(),
            recommended_provider: provider.clone(),
            would_apply: true,
            estimated_savings: savings(final_tier),
            reason: RoutingReason::Routed,
        },
        model,
        provider,
        tier: final_tier,
        reason: RoutingReason::Routed,
        applied: true,
        thinking,
        budget: budget_check,
        ab: ab_assignment,
    }
}

/// Output for a budget block: routing is not applied and the sidecar is
/// expected to answer 429.
fn blocked_output(
    classification: &ClassificationResult,
    routing: &RoutingConfig,
    ctx: &RequestContext<'_>,
    run_id: &str,
    check: BudgetCheck,
    recommended_model: &str,
    estimated_savings: f64,
) -> RoutingOutput {
    let model = ctx.original_model.to_string();
    let provider = routing.resolve_provider(&model);
    RoutingOutput {
        headers: provider_headers(&provider, routing),
        shadow: ShadowRecommendation {
            run_id: run_id.to_string(),
            original_model: ctx.original_model.to_string(),
            recommended_model: recommended_model.to_string(),
            recommended_provider: routing.resolve_provider(recommended_model),
            would_apply: false,
            estimated_savings,
            reason: RoutingReason::RoutingDisabled,
        },
        model,
        provider,
        tier: classification.tier,
        reason: RoutingReason::RoutingDisabled,
        applied: false,
        thinking: None,
        budget: Some(check),
        ab: None,
    }
}

/// Per-provider outgoing headers. OpenRouter gets its attribution pair;
/// everyone else gets none.
fn provider_headers(provider: &str, routing: &RoutingConfig) -> HashMap<String, String> {
    if provider == "openrouter" {
        HashMap::from([
            ("X-Title".to_string(), routing.open_router_headers.x_title.clone()),
            (
                "HTTP-Referer".to_string(),
                routing.open_router_headers.http_referer.clone(),
            ),
        ])
    } else {
        HashMap::new()
    }
}
