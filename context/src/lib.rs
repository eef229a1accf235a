//! Caching and token counting for fenceref.
//!
//! - [`HierarchicalCache`]: memory LRU (Tier 1) in front of a SQLite store (Tier 2)
//! - [`CachedTokenCounter`]: `o200k_base` token counts cached by content hash

mod cache;
mod durable;
mod memory;
mod sqlite_util;
mod token_counter;

pub use cache::{CacheEntry, HierarchicalCache, Namespace, Tier};
pub use durable::{DurableRow, DurableTier};
pub use token_counter::{
    CachedTokenCounter, ENCODING_NAME, TiktokenTokenizer, TokenCountResult, TokenCounter,
    TokenizeError, Tokenizer, content_hash, heuristic_estimate,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
