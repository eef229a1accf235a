//! Token counting using tiktoken.
//!
//! Every count in the system uses the `o200k_base` encoding so block totals
//! are comparable against model context limits. Counts are cached by content
//! hash in their own namespace of the two-tier cache.
//!
//! When the tokenizer fails the count is retried once, then replaced by a
//! heuristic estimate (characters / 4) flagged as approximate. Approximate
//! counts are never written to the cache.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tiktoken_rs::{CoreBPE, o200k_base};

use crate::CacheError;
use crate::cache::HierarchicalCache;

/// Encoding name recorded alongside every count.
pub const ENCODING_NAME: &str = "o200k_base";

/// Average characters per token used by the fallback estimate.
const HEURISTIC_CHARS_PER_TOKEN: usize = 4;

/// The tiktoken encoder is expensive to initialize (loads vocabulary data),
/// so we create it once and reuse it across all counters.
static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| o200k_base().ok()).as_ref()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("tokenizer '{encoding}' failed: {message}")]
pub struct TokenizeError {
    pub encoding: String,
    pub message: String,
}

/// A fixed tokenizer encoding.
pub trait Tokenizer: Send + Sync {
    /// Encoding identifier; part of every cache key.
    fn encoding(&self) -> &str;

    fn count(&self, text: &str) -> Result<usize, TokenizeError>;
}

/// Process-wide tiktoken `o200k_base` tokenizer.
#[derive(Clone, Copy)]
pub struct TiktokenTokenizer {
    encoder: Option<&'static CoreBPE>,
}

impl std::fmt::Debug for TiktokenTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenTokenizer")
            .field("encoder", &self.encoder.as_ref().map(|_| "<CoreBPE>"))
            .finish()
    }
}

impl TiktokenTokenizer {
    #[must_use]
    pub fn new() -> Self {
        let encoder = get_encoder();
        if encoder.is_none() {
            tracing::error!(
                "Failed to initialize tiktoken o200k_base encoder. Counts will use the heuristic estimate."
            );
        }
        Self { encoder }
    }
}

impl Default for TiktokenTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encoding(&self) -> &str {
        ENCODING_NAME
    }

    fn count(&self, text: &str) -> Result<usize, TokenizeError> {
        match self.encoder {
            Some(encoder) => Ok(encoder.encode_ordinary(text).len()),
            None => Err(TokenizeError {
                encoding: ENCODING_NAME.to_string(),
                message: "encoder unavailable".to_string(),
            }),
        }
    }
}

/// Immutable count for one (content, encoding) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCountResult {
    pub content_hash: String,
    pub count: u32,
    pub encoding_version: String,
    /// True when the tokenizer failed and the heuristic estimate was used.
    #[serde(default)]
    pub approximate: bool,
}

/// Hex SHA-256 of `text`.
#[must_use]
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = hasher.finalize();
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Uncached counter: tokenizer with retry-once and heuristic fallback.
#[derive(Clone)]
pub struct TokenCounter {
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoding", &self.tokenizer.encoding())
            .finish()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(Arc::new(TiktokenTokenizer::new()))
    }
}

impl TokenCounter {
    #[must_use]
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    #[must_use]
    pub fn encoding(&self) -> &str {
        self.tokenizer.encoding()
    }

    #[must_use]
    pub fn count(&self, text: &str) -> TokenCountResult {
        let content_hash = content_hash(text);
        let encoding_version = self.tokenizer.encoding().to_string();

        if text.is_empty() {
            return TokenCountResult {
                content_hash,
                count: 0,
                encoding_version,
                approximate: false,
            };
        }

        let attempt = self.tokenizer.count(text).or_else(|first| {
            tracing::debug!(error = %first, "Tokenizer failed; retrying once");
            self.tokenizer.count(text)
        });

        match attempt {
            Ok(count) => TokenCountResult {
                content_hash,
                count: u32::try_from(count).unwrap_or(u32::MAX),
                encoding_version,
                approximate: false,
            },
            Err(e) => {
                let estimate = heuristic_estimate(text);
                tracing::warn!(
                    error = %e,
                    estimate,
                    "Tokenization degraded; using heuristic estimate"
                );
                TokenCountResult {
                    content_hash,
                    count: estimate,
                    encoding_version,
                    approximate: true,
                }
            }
        }
    }
}

/// Character count divided by the average characters per token, rounded up.
#[must_use]
pub fn heuristic_estimate(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(HEURISTIC_CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Token counter backed by the two-tier cache, keyed by encoding and content hash.
#[derive(Debug)]
pub struct CachedTokenCounter {
    counter: TokenCounter,
    cache: HierarchicalCache,
    ttl: Duration,
}

impl CachedTokenCounter {
    #[must_use]
    pub fn new(counter: TokenCounter, cache: HierarchicalCache, ttl: Duration) -> Self {
        Self {
            counter,
            cache,
            ttl,
        }
    }

    #[must_use]
    pub fn encoding(&self) -> &str {
        self.counter.encoding()
    }

    pub fn count(&self, text: &str) -> Result<TokenCountResult, CacheError> {
        if text.is_empty() {
            return Ok(self.counter.count(text));
        }

        let hash = content_hash(text);
        let key = format!("{}:{hash}", self.counter.encoding());
        if let Some(cached) = self.cache.get_json::<TokenCountResult>(&key)? {
            return Ok(cached);
        }

        let result = self.counter.count(text);
        if !result.approximate {
            self.cache.put_json(&key, &result, self.ttl)?;
        }
        Ok(result)
    }

    /// Drop every cached count.
    pub fn clear(&self) -> Result<usize, CacheError> {
        self.cache.invalidate_all()
    }
}
