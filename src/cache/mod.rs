// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Two caches and a request batcher in front of the generator.
//!
//! * Prompt-exact cache: SHA-256 keyed on `model ‖ quantized temperature ‖
//!   canonicalized prompt`, long TTL, invalidated per masterplan.
//! * Retrieval-similarity cache: exact hash first, cosine fallback at ≥ 0.95
//!   on miss, short TTL (retrieval corpora are volatile).
//! * Batcher: tumbling window that concatenates concurrent prompts into one
//!   generator call and splits the response back to the waiters.
//!
//! Laws the callers rely on: a hit never reaches the generator; a miss is
//! followed by exactly one write when the call succeeds and none when it
//! fails; writes are idempotent by key.

mod batcher;
mod cached_generator;
mod prompt;
mod retrieval;

pub use batcher::{RequestBatcher, BATCH_SENTINEL};
pub use cached_generator::CachedGenerator;
pub use prompt::{PromptCache, DEFAULT_PROMPT_TTL};
pub use retrieval::{RetrievalCache, DEFAULT_RETRIEVAL_TTL, SIMILARITY_FLOOR};

use sha2::{Digest, Sha256};

/// Collapse insignificant whitespace; JSON-shaped prompts additionally get
/// their object keys sorted so formatting differences cannot defeat the
/// cache.
pub fn canonicalize(text: &str) -> String {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        // serde_json maps are ordered, so re-serialization is canonical.
        if value.is_object() || value.is_array() {
            if let Ok(canonical) = serde_json::to_string(&value) {
                return canonical;
            }
        }
    }
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache key for a prompt call. Temperature is quantized to two decimals so
/// float noise does not fragment the keyspace.
pub fn prompt_key(model: &str, temperature: f64, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0x1f]);
    hasher.update(((temperature * 100.0).round() as i64).to_le_bytes());
    hasher.update([0x1f]);
    hasher.update(canonicalize(prompt).as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache key for a retrieval query.
pub fn retrieval_key(query: &str, top_k: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(query).as_bytes());
    hasher.update([0x1f]);
    hasher.update((top_k as u64).to_le_bytes());
    hex::encode(hasher.finalize())
}
