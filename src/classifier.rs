//! Complexity classifier — decides which tier a conversation belongs to.
//!
//! The classifier is a deterministic, single-pass function over the message
//! list. It never errors and never suspends: malformed content contributes
//! zero text, and an empty conversation short-circuits to `simple`.
//!
//! Scoring happens in four stages:
//!
//! 1. **Keyword signals** over the analysis window (last three messages plus
//!    the last user message).
//! 2. **Structural signals** over the entire message list (length, turns,
//!    code fences, tool usage).
//! 3. **Historical context boosts** (escalation patterns, heavy tool usage,
//!    iterative problem solving).
//! 4. **Context adjustments** (math, architecture, trivially short chats).
//!
//! All contributions accumulate into raw per-tier scores which are normalized
//! once at the end, so `Σ scores == 1` holds for every result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::Tier;

/// Weight added to a tier for each keyword hit.
const KEYWORD_WEIGHT: f64 = 0.25;

/// Neutral starting score per tier, so normalization is well-defined before
/// any evidence arrives.
const BASE_SCORE: f64 = 0.25;

/// Tier keyword sets. Single words match on token boundaries; phrases match
/// as substrings. The four sets are disjoint.
const SIMPLE_KEYWORDS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "thanks",
    "thank you",
    "what is",
    "what's",
    "who is",
    "define",
    "meaning of",
    "translate",
    "convert",
    "capital of",
    "how many",
    "yes or no",
];

const MID_KEYWORDS: &[&str] = &[
    "write a function",
    "implement",
    "refactor",
    "explain",
    "summarize",
    "draft",
    "compare",
    "review",
    "unit test",
    "rename",
    "document this",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "architecture",
    "design a system",
    "scalability",
    "distributed",
    "migration",
    "concurrency",
    "microservice",
    "security audit",
    "trade-off",
    "tradeoffs",
    "end-to-end",
];

const REASONING_KEYWORDS: &[&str] = &[
    "prove",
    "theorem",
    "step by step",
    "chain of thought",
    "formal proof",
    "logic puzzle",
    "optimal strategy",
    "np-hard",
    "complexity analysis",
];

/// Words whose repeated appearance marks an iterative debugging session.
const PROBLEM_KEYWORDS: &[&str] = &["error", "bug", "fix", "fail", "issue", "broken", "debug", "crash"];

/// Phrases that push a request toward the reasoning tier.
const MATH_INDICATORS: &[&str] = &[
    "calculate",
    "equation",
    "solve for",
    "algebra",
    "geometry",
    "probability",
    "matrix",
    "derivative",
    "integral",
];

/// Phrases that push a request toward the complex tier.
const ARCHITECTURE_INDICATORS: &[&str] = &[
    "system design",
    "architecture",
    "scalab",
    "microservice",
    "database schema",
    "high availability",
    "load balanc",
    "distributed system",
];

/// A chat message as seen by the classifier. Read-only to the core.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
    /// Present when the assistant requested tool calls. Only presence matters
    /// here; the payload shape is the provider's business.
    #[serde(default)]
    pub tool_calls: Option<serde_json::Value>,
}

impl Message {
    /// Flatten the content into plain text. Strings pass through; content
    /// blocks contribute their `text` fields; anything else contributes
    /// nothing.
    pub fn text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Blocks(blocks)) => blocks
                .iter()
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
            Some(MessageContent::Other(_)) | None => String::new(),
        }
    }

    fn bears_tools(&self) -> bool {
        self.role == Role::Tool || self.tool_calls.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Roles this sidecar doesn't know about pass through untouched.
    #[default]
    #[serde(other)]
    Other,
}

/// Chat content is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    /// Anything else (numbers, objects) — contributes zero text.
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// The classifier's verdict for one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub tier: Tier,
    /// `min(1, 0.5 + (top − second))`, rounded to 2 decimals.
    pub confidence: f64,
    pub reason: String,
    /// Normalized per-tier scores; they sum to 1.
    pub scores: BTreeMap<Tier, f64>,
    /// Tags explaining every contribution: `keyword:*`, `structural:*`,
    /// `context:*`.
    pub signals: Vec<String>,
}

/// Raw per-tier score accumulator, indexed by tier rank.
#[derive(Debug, Clone, Copy)]
struct TierScores([f64; 4]);

impl TierScores {
    fn new() -> Self {
        Self([BASE_SCORE; 4])
    }

    fn add(&mut self, tier: Tier, amount: f64) {
        self.0[tier.rank() as usize - 1] += amount;
    }

    fn normalize(&mut self) {
        let sum: f64 = self.0.iter().sum();
        for s in &mut self.0 {
            *s /= sum;
        }
    }

    /// Winning tier and the top-two margin. Exact ties resolve to the higher
    /// tier so an ambiguous request is never under-served.
    fn argmax(&self) -> (Tier, f64) {
        let mut best = Tier::Simple;
        let mut top = f64::MIN;
        for tier in Tier::ALL {
            let s = self.0[tier.rank() as usize - 1];
            if s >= top {
                top = s;
                best = tier;
            }
        }
        let second = Tier::ALL
            .into_iter()
            .filter(|t| *t != best)
            .map(|t| self.0[t.rank() as usize - 1])
            .fold(f64::MIN, f64::max);
        (best, top - second)
    }

    fn as_map(&self) -> BTreeMap<Tier, f64> {
        Tier::ALL
            .into_iter()
            .map(|t| (t, self.0[t.rank() as usize - 1]))
            .collect()
    }
}

/// Classify a conversation. Pure, infallible.
pub fn classify(messages: &[Message]) -> ClassificationResult {
    if messages.is_empty() {
        let mut scores = BTreeMap::new();
        scores.insert(Tier::Simple, 1.0);
        scores.insert(Tier::Mid, 0.0);
        scores.insert(Tier::Complex, 0.0);
        scores.insert(Tier::Reasoning, 0.0);
        return ClassificationResult {
            tier: Tier::Simple,
            confidence: 0.5,
            reason: "empty conversation".into(),
            scores,
            signals: vec!["structural:empty-conversation".into()],
        };
    }

    let mut scores = TierScores::new();
    let mut signals = Vec::new();

    // ---- keyword signals over the analysis window ----
    let window_text = analysis_window_text(messages);
    for (set, tier) in [
        (SIMPLE_KEYWORDS, Tier::Simple),
        (MID_KEYWORDS, Tier::Mid),
        (COMPLEX_KEYWORDS, Tier::Complex),
        (REASONING_KEYWORDS, Tier::Reasoning),
    ] {
        for kw in set {
            if matches_keyword(&window_text, kw) {
                scores.add(tier, KEYWORD_WEIGHT);
                signals.push(format!("keyword:{kw}"));
            }
        }
    }

    // ---- structural signals over the whole list ----
    let texts: Vec<String> = messages.iter().map(Message::text).collect();
    let total_chars: usize = texts.iter().map(String::len).sum();
    let user_lens: Vec<usize> = messages
        .iter()
        .zip(&texts)
        .filter(|(m, _)| m.role == Role::User)
        .map(|(_, t)| t.len())
        .collect();
    let avg_user_len = if user_lens.is_empty() {
        0.0
    } else {
        user_lens.iter().sum::<usize>() as f64 / user_lens.len() as f64
    };
    let tool_messages = messages.iter().filter(|m| m.bears_tools()).count();

    if total_chars > 8000 {
        scores.add(Tier::Complex, 0.30);
        signals.push("structural:very-long-text".into());
    } else if total_chars > 2000 {
        scores.add(Tier::Mid, 0.15);
        signals.push("structural:long-text".into());
    }
    if user_lens.len() > 5 {
        scores.add(Tier::Complex, 0.15);
        signals.push("structural:many-turns".into());
    }
    if texts.iter().any(|t| t.contains("```")) {
        scores.add(Tier::Mid, 0.20);
        scores.add(Tier::Complex, 0.10);
        signals.push("structural:code-blocks".into());
    }
    if tool_messages > 0 {
        scores.add(Tier::Mid, 0.10);
        signals.push("structural:tool-use".into());
    }
    if avg_user_len > 500.0 {
        scores.add(Tier::Complex, 0.15);
        signals.push("structural:long-user-messages".into());
    }

    // ---- historical context boosts ----
    if avg_user_len > 1000.0 {
        scores.add(Tier::Complex, 0.20);
        scores.add(Tier::Reasoning, 0.10);
        signals.push("context:lengthy-conversation-pattern".into());
    }
    if user_lens.len() >= 4 {
        let half = user_lens.len() / 2;
        let early = user_lens[..half].iter().sum::<usize>() as f64 / half as f64;
        let late_count = user_lens.len() - half;
        let late = user_lens[half..].iter().sum::<usize>() as f64 / late_count as f64;
        if early > 0.0 && late > 2.0 * early {
            scores.add(Tier::Complex, 0.20);
            scores.add(Tier::Reasoning, 0.10);
            signals.push("context:escalating-complexity".into());
        }
    }
    if tool_messages > 2 {
        scores.add(Tier::Complex, 0.25);
        signals.push("context:heavy-tool-usage".into());
    } else if tool_messages > 0 {
        scores.add(Tier::Complex, 0.10);
        signals.push("context:moderate-tool-usage".into());
    }
    let problem_messages = texts
        .iter()
        .filter(|t| {
            let lower = t.to_lowercase();
            PROBLEM_KEYWORDS.iter().any(|kw| matches_keyword(&lower, kw))
        })
        .count();
    if problem_messages > 1 {
        scores.add(Tier::Complex, 0.20);
        scores.add(Tier::Reasoning, 0.15);
        signals.push("context:iterative-problem-solving".into());
    }

    // ---- context adjustments ----
    let all_text: String = {
        let mut joined = texts.join("\n");
        joined.make_ascii_lowercase();
        joined
    };
    if MATH_INDICATORS.iter().any(|kw| matches_keyword(&all_text, kw)) {
        scores.add(Tier::Reasoning, 0.2);
        signals.push("context:math-indicators".into());
    }
    if ARCHITECTURE_INDICATORS.iter().any(|kw| all_text.contains(kw)) {
        scores.add(Tier::Complex, 0.3);
        signals.push("context:architecture-indicators".into());
    }
    if messages.len() <= 2 && total_chars < 100 {
        scores.add(Tier::Simple, 0.3);
        signals.push("context:short-conversation".into());
    }

    // ---- normalize and decide ----
    scores.normalize();
    let (tier, margin) = scores.argmax();
    let confidence = round2((0.5 + margin).min(1.0));
    let reason = format!(
        "{tier} scored highest from {count} signal(s)",
        count = signals.len()
    );

    ClassificationResult {
        tier,
        confidence,
        reason,
        scores: scores.as_map(),
        signals,
    }
}

/// The keyword analysis window: last three messages plus the last user
/// message (prepended when it fell outside the tail), flattened and
/// lowercased.
fn analysis_window_text(messages: &[Message]) -> String {
    let start = messages.len().saturating_sub(3);
    let mut window: Vec<&Message> = messages[start..].iter().collect();
    if let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) {
        if !window.iter().any(|m| std::ptr::eq(*m, last_user)) {
            window.insert(0, last_user);
        }
    }
    let mut text = window
        .iter()
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join("\n");
    text.make_ascii_lowercase();
    text
}

/// Phrases (containing whitespace) match as substrings; single words match on
/// token boundaries so `hi` doesn't light up inside `this`.
fn matches_keyword(haystack: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        haystack.contains(keyword)
    } else {
        haystack
            .split(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-')
            .any(|word| word == keyword)
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
