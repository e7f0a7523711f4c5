//! Model pricing and cost estimation.
//!
//! Lookup priority for a model's rates: explicit custom map → dynamic cache
//! (when configured) → built-in static table → tier-inferred fallback from
//! the static table → the mid tier's rate as a last resort. Every path
//! returns *some* rate, so cost estimation never fails.
//!
//! The dynamic cache is a read-through TTL map populated by a background
//! refresh task (`refresh` fetches an OpenRouter-style `/api/v1/models`
//! listing). Reads are synchronous — the routing path never suspends.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::{default_tier_model, infer_tier_from_model, Tier};

/// USD per 1 000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    /// `(input + output) / 2` — the blended rate used for savings
    /// comparisons.
    fn average(self) -> f64 {
        (self.input_per_1k + self.output_per_1k) / 2.0
    }
}

/// Built-in rate table. Values track published list prices; the dynamic
/// cache overrides them when fresher data is available.
const BUILTIN_PRICING: &[(&str, Pricing)] = &[
    ("anthropic/claude-3-haiku-20240307", Pricing { input_per_1k: 0.00025, output_per_1k: 0.00125 }),
    ("anthropic/claude-3-5-haiku-20241022", Pricing { input_per_1k: 0.0008, output_per_1k: 0.004 }),
    ("anthropic/claude-3-5-sonnet-20241022", Pricing { input_per_1k: 0.003, output_per_1k: 0.015 }),
    ("anthropic/claude-3-7-sonnet-20250219", Pricing { input_per_1k: 0.003, output_per_1k: 0.015 }),
    ("anthropic/claude-3-opus-20240229", Pricing { input_per_1k: 0.015, output_per_1k: 0.075 }),
    ("openai/gpt-4o", Pricing { input_per_1k: 0.0025, output_per_1k: 0.01 }),
    ("openai/gpt-4o-mini", Pricing { input_per_1k: 0.00015, output_per_1k: 0.0006 }),
    ("openai/gpt-4.1", Pricing { input_per_1k: 0.002, output_per_1k: 0.008 }),
    ("openai/gpt-4.1-mini", Pricing { input_per_1k: 0.0004, output_per_1k: 0.0016 }),
    ("openai/gpt-4.1-nano", Pricing { input_per_1k: 0.0001, output_per_1k: 0.0004 }),
    ("openai/gpt-3.5-turbo", Pricing { input_per_1k: 0.0005, output_per_1k: 0.0015 }),
    ("openai/o1", Pricing { input_per_1k: 0.015, output_per_1k: 0.06 }),
    ("openai/o3", Pricing { input_per_1k: 0.002, output_per_1k: 0.008 }),
    ("openai/o4-mini", Pricing { input_per_1k: 0.0011, output_per_1k: 0.0044 }),
    ("deepseek/deepseek-v3", Pricing { input_per_1k: 0.00027, output_per_1k: 0.0011 }),
    ("deepseek/deepseek-r1", Pricing { input_per_1k: 0.00055, output_per_1k: 0.00219 }),
    ("google/gemini-2.5-pro", Pricing { input_per_1k: 0.00125, output_per_1k: 0.01 }),
    ("google/gemini-2.0-flash", Pricing { input_per_1k: 0.0001, output_per_1k: 0.0004 }),
    ("meta/llama-4-maverick", Pricing { input_per_1k: 0.00018, output_per_1k: 0.0006 }),
];

fn builtin_pricing(model: &str) -> Option<Pricing> {
    BUILTIN_PRICING
        .iter()
        .find(|(id, _)| *id == model)
        .map(|(_, p)| *p)
}

/// TTL'd dynamic rate cache, refreshed out-of-band.
pub struct DynamicPricingCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Pricing, Instant)>>,
}

impl DynamicPricingCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    /// Synchronous cache read; expired entries read as absent.
    pub fn get(&self, model: &str) -> Option<Pricing> {
        let entries = self.entries.read().expect("pricing cache lock poisoned");
        entries
            .get(model)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(p, _)| *p)
    }

    pub fn insert_all(&self, rates: HashMap<String, Pricing>) {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("pricing cache lock poisoned");
        for (model, pricing) in rates {
            entries.insert(model, (pricing, now));
        }
    }

    /// Fetch an OpenRouter-style models listing and replace cache contents.
    /// Listing rates are USD per token; they are scaled to per-1k here.
    pub async fn refresh(&self, client: &reqwest::Client, url: &str) -> anyhow::Result<usize> {
        let response = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "pricing refresh returned HTTP {}",
            response.status()
        );
        let listing: ModelsListing = response.json().await.context("parsing models listing")?;

        let mut rates = HashMap::new();
        for model in listing.data {
            let (Some(prompt), Some(completion)) = (
                model.pricing.prompt.parse::<f64>().ok(),
                model.pricing.completion.parse::<f64>().ok(),
            ) else {
                continue;
            };
            rates.insert(
                model.id,
                Pricing {
                    input_per_1k: prompt * 1000.0,
                    output_per_1k: completion * 1000.0,
                },
            );
        }
        let count = rates.len();
        self.insert_all(rates);
        Ok(count)
    }
}

#[derive(Debug, Deserialize)]
struct ModelsListing {
    data: Vec<ListedModel>,
}

#[derive(Debug, Deserialize)]
struct ListedModel {
    id: String,
    pricing: ListedPricing,
}

/// OpenRouter serves per-token rates as decimal strings.
#[derive(Debug, Deserialize)]
struct ListedPricing {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    completion: String,
}

/// The sidecar's pricing source of truth.
pub struct PricingBook {
    custom: HashMap<String, Pricing>,
    dynamic: Option<DynamicPricingCache>,
}

impl PricingBook {
    pub fn new(custom: HashMap<String, Pricing>, dynamic: Option<DynamicPricingCache>) -> Self {
        Self { custom, dynamic }
    }

    pub fn dynamic(&self) -> Option<&DynamicPricingCache> {
        self.dynamic.as_ref()
    }

    /// Resolve a model's rate, falling through the documented priority
    /// chain. Never fails.
    pub fn lookup(&self, model: &str) -> Pricing {
        if let Some(p) = self.custom.get(model) {
            return *p;
        }
        if let Some(p) = self.dynamic.as_ref().and_then(|c| c.get(model)) {
            return p;
        }
        if let Some(p) = builtin_pricing(model) {
            return p;
        }
        let tier = infer_tier_from_model(model);
        builtin_pricing(default_tier_model(tier))
            .or_else(|| builtin_pricing(default_tier_model(Tier::Mid)))
            .expect("built-in table covers every default tier model")
    }

    /// Estimated request cost in USD, rounded to 6 decimal places.
    pub fn estimate_model_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self.lookup(model);
        let cost = input_tokens as f64 / 1000.0 * pricing.input_per_1k
            + output_tokens as f64 / 1000.0 * pricing.output_per_1k;
        round_to(cost, 6)
    }

    /// Percentage saved (two decimals) by moving from `original` to the
    /// target tier's model. Zero when the original's blended rate is zero;
    /// negative when the target is more expensive.
    pub fn calculate_routing_savings(&self, original: &str, target_tier: Tier) -> f64 {
        let orig_avg = self.lookup(original).average();
        if orig_avg == 0.0 {
            return 0.0;
        }
        let target_avg = self.lookup(default_tier_model(target_tier)).average();
        round_to((orig_avg - target_avg) / orig_avg * 100.0, 2)
    }
}

impl Default for PricingBook {
    fn default() -> Self {
        Self::new(HashMap::new(), None)
    }
}

fn round_to(x: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (x * scale).round() / scale
}
