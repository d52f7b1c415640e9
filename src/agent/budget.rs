//! Context-budget arithmetic.
//!
//! Token counts are estimated as `ceil(chars / 4)`; there is no real
//! tokenizer, so every limit here is approximate. The 30/70 split between
//! system instructions and user prompt is a tunable default
//! ([`ExecutorConfig::system_share`](super::ExecutorConfig)).

/// Appended to any prompt cut down to fit the budget.
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

const CHARS_PER_TOKEN: usize = 4;

/// Estimated token cost of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Prompts cut down to fit a context budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedPrompts {
    pub system: String,
    pub user: String,
    /// Tokens available to both prompts together.
    pub available_tokens: usize,
    pub system_budget: usize,
    pub user_budget: usize,
}

impl TruncatedPrompts {
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.system) + estimate_tokens(&self.user)
    }
}

/// Keep the head of `text` so that it fits in `budget` tokens, marker included.
pub fn truncate_to_tokens(text: &str, budget: usize) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }
    let max_chars = budget * CHARS_PER_TOKEN;
    let marker_chars = TRUNCATION_MARKER.chars().count();
    if max_chars < marker_chars {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - marker_chars).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Fit both prompts into `context_limit - reserved_completion` tokens.
///
/// The system instructions get at most `system_share` of the available
/// budget; whatever they leave unused goes to the user prompt.
pub fn truncate_for_budget(
    system: &str,
    user: &str,
    context_limit: usize,
    reserved_completion: usize,
    system_share: f64,
) -> TruncatedPrompts {
    let available = context_limit.saturating_sub(reserved_completion);
    let share = system_share.clamp(0.0, 1.0);
    let system_cap = (available as f64 * share).floor() as usize;

    let system_budget = estimate_tokens(system).min(system_cap);
    let user_budget = available - system_budget;

    TruncatedPrompts {
        system: truncate_to_tokens(system, system_budget),
        user: truncate_to_tokens(user, user_budget),
        available_tokens: available,
        system_budget,
        user_budget,
    }
}
