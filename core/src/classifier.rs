//! Prompt classification against the fixed routing rule table.
//!
//! Classification is a pure function of the prompt and the rule table: no
//! hidden state, no randomness, so the same prompt always yields the same
//! decision. Rules are evaluated in order and the first match wins; the
//! ordering is part of the contract because the rules are not mutually
//! exclusive.

use serde::Serialize;

use crate::store::MessageRecord;

/// Key of one upstream provider known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKey {
    Claude,
    Chatgpt,
    Gemini,
    Llama,
}

impl ProviderKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Chatgpt => "chatgpt",
            Self::Gemini => "gemini",
            Self::Llama => "llama",
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            Self::Claude => "Claude",
            Self::Chatgpt => "ChatGPT",
            Self::Gemini => "Gemini",
            Self::Llama => "LLaMA",
        }
    }
}

/// Which rule in the table produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteRule {
    Technical,
    Conversational,
    Quantitative,
    Visual,
    Default,
}

/// Outcome of classifying one prompt. Ephemeral: computed per turn, threaded
/// through the dispatch call, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub provider: ProviderKey,
    pub rule: RouteRule,
    pub matched: Option<String>,
}

impl RoutingDecision {
    /// Human-readable label recorded on the assistant message. The visual
    /// rule routes to a text+image pair, so both names appear joined by the
    /// combination marker.
    pub fn model_label(&self) -> String {
        match self.rule {
            RouteRule::Visual => format!("{} + DALL-E", ProviderKey::Gemini.display()),
            _ => self.provider.display().to_string(),
        }
    }
}

const CODE_FENCE: &str = "```";

const TECHNICAL_MARKERS: &[&str] = &[
    "code",
    "response",
    "snippet",
    "script",
    "function",
    "class",
    "method",
    "program",
    "algorithm",
    "recursion",
    "loop",
    "html",
    "css",
    "javascript",
    "python",
    "java",
];

const CONVERSATIONAL_MARKERS: &[&str] = &[
    "sorry", "hey", "hello", "feeling", "sad", "mad",
];

const QUANTITATIVE_MARKERS: &[&str] = &[
    "km", "m", "cm", "sec", "secs", "seconds", "minutes", "hours", "crosses",
];

const VISUAL_MARKERS: &[&str] = &["image", "create", "generate"];

/// Score the prompt against the rule table and name the provider that should
/// answer it. `history` is part of the contract so future rules can weigh
/// earlier turns; the current table keys off the prompt alone.
pub fn classify(prompt: &str, _history: &[MessageRecord]) -> RoutingDecision {
    let tokens = tokenize(prompt);

    if prompt.contains(CODE_FENCE) {
        return RoutingDecision {
            provider: ProviderKey::Claude,
            rule: RouteRule::Technical,
            matched: Some(CODE_FENCE.to_string()),
        };
    }
    if let Some(word) = first_match(&tokens, TECHNICAL_MARKERS) {
        return RoutingDecision {
            provider: ProviderKey::Claude,
            rule: RouteRule::Technical,
            matched: Some(word),
        };
    }
    if let Some(word) = first_match(&tokens, CONVERSATIONAL_MARKERS) {
        return RoutingDecision {
            provider: ProviderKey::Chatgpt,
            rule: RouteRule::Conversational,
            matched: Some(word),
        };
    }
    if let Some(word) = first_match(&tokens, QUANTITATIVE_MARKERS) {
        return RoutingDecision {
            provider: ProviderKey::Llama,
            rule: RouteRule::Quantitative,
            matched: Some(word),
        };
    }
    if let Some(word) = first_match(&tokens, VISUAL_MARKERS) {
        return RoutingDecision {
            provider: ProviderKey::Gemini,
            rule: RouteRule::Visual,
            matched: Some(word),
        };
    }

    RoutingDecision {
        provider: ProviderKey::Chatgpt,
        rule: RouteRule::Default,
        matched: None,
    }
}

// Token-based matching rather than raw substring search, so "m" only matches
// a standalone unit and "scode" does not match "code".
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn first_match(tokens: &[String], markers: &[&str]) -> Option<String> {
    tokens
        .iter()
        .find(|token| markers.contains(&token.as_str()))
        .map(|token| token.clone())
}
