//! Deterministic token estimation
//!
//! Not a tokenizer. The estimate only has to be stable for identical text so
//! that caps and budget decisions are reproducible. Arithmetic is done in
//! hundredths of a token to keep it integer-exact.

use crate::domain::EndpointType;

/// Output guess used when nothing tighter is known
pub const DEFAULT_OUTPUT_TOKENS: u64 = 256;

const LONG_WORD_WEIGHT: u64 = 150;
const MEDIUM_WORD_WEIGHT: u64 = 130;
const SHORT_WORD_WEIGHT: u64 = 100;
const SPECIAL_CHAR_WEIGHT: u64 = 50;
const EXTRA_WHITESPACE_WEIGHT: u64 = 25;

/// Estimate the token count of `text`; never less than 1
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    let word_chars: u64 = text
        .split_whitespace()
        .map(|word| word.chars().count() as u64)
        .sum();
    let specials = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count() as u64;
    let whitespace = text.chars().filter(|c| c.is_whitespace()).count() as u64;
    let extra_whitespace = whitespace.saturating_sub(words.saturating_sub(1));

    // Longer average words split into more tokens
    let word_weight = if word_chars > 6 * words {
        LONG_WORD_WEIGHT
    } else if word_chars > 4 * words {
        MEDIUM_WORD_WEIGHT
    } else {
        SHORT_WORD_WEIGHT
    };

    let hundredths = words * word_weight
        + specials * SPECIAL_CHAR_WEIGHT
        + extra_whitespace * EXTRA_WHITESPACE_WEIGHT;
    hundredths.div_ceil(100).max(1)
}

/// Guess the output tokens of a call, bounded by the request and policy caps
pub fn estimate_output_tokens(
    endpoint: EndpointType,
    requested_cap: Option<u64>,
    policy_cap: Option<u32>,
) -> u64 {
    if endpoint == EndpointType::Embeddings {
        return 0;
    }
    let bound = [requested_cap, policy_cap.map(u64::from)]
        .into_iter()
        .flatten()
        .min();
    bound
        .map_or(DEFAULT_OUTPUT_TOKENS, |bound| bound.min(DEFAULT_OUTPUT_TOKENS))
        .max(1)
}
