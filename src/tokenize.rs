//! Retrieval tokenization and token-accounting helpers.
//!
//! Indexed chunks carry pre-tokenized variants of their content so the search
//! index can match on normalized terms without re-analyzing at query time.
//! Two granularities are stored: a coarse pass that lowercases and splits on
//! non-alphanumeric boundaries, and a fine pass that additionally separates
//! letter and digit runs inside mixed terms. Token accounting prefers the
//! `cl100k_base` encoding and falls back to whitespace counting when the
//! tokenizer is unavailable.

use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Tokenize text into a space-joined sequence of lowercase terms.
pub fn tokenize(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| term.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split mixed letter/digit terms in an already-tokenized string.
///
/// `v2raptor` becomes `v 2 raptor`; pure-letter and pure-digit terms pass
/// through unchanged. The input is expected to be output of [`tokenize`].
pub fn fine_grained_tokenize(tokens: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for term in tokens.split_whitespace() {
        let mut run = String::new();
        let mut run_is_digit: Option<bool> = None;
        for c in term.chars() {
            let is_digit = c.is_ascii_digit();
            if run_is_digit != Some(is_digit) && !run.is_empty() {
                out.push(std::mem::take(&mut run));
            }
            run_is_digit = Some(is_digit);
            run.push(c);
        }
        if !run.is_empty() {
            out.push(run);
        }
    }
    out.join(" ")
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn normalize_space(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn encoding() -> Option<&'static CoreBPE> {
    static ENCODING: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODING.get_or_init(|| cl100k_base().ok()).as_ref()
}

/// Count tokens in a text segment.
///
/// Uses the `cl100k_base` encoding when available and falls back to a
/// whitespace count otherwise, so accounting keeps working for models without
/// a published tokenizer.
pub fn count_tokens(text: &str) -> usize {
    match encoding() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.split_whitespace().count(),
    }
}

/// Trim a text to at most `budget` tokens, preserving leading content.
pub fn truncate_tokens(text: &str, budget: usize) -> String {
    if budget == 0 {
        return String::new();
    }
    if count_tokens(text) <= budget {
        return text.to_string();
    }
    if let Some(bpe) = encoding() {
        let tokens = bpe.encode_ordinary(text);
        let clipped = &tokens[..budget.min(tokens.len())];
        if let Ok(decoded) = bpe.decode(clipped.to_vec()) {
            return decoded;
        }
    }
    // Whitespace fallback mirrors the counting fallback.
    text.split_whitespace()
        .take(budget)
        .collect::<Vec<_>>()
        .join(" ")
}
