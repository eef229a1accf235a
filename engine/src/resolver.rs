//! Parse, dispatch, cache, substitute, count.
//!
//! Distinct references are resolved concurrently; substitution is driven by
//! the spans recorded at parse time, so completion order never affects the
//! output text.

use std::ops::Range;
use std::time::Duration;

use fenceref_context::{
    CacheError, CachedTokenCounter, HierarchicalCache, TokenCountResult, content_hash,
};
use fenceref_tools::{HandlerRegistry, Resolved, Snapshot};
use fenceref_types::{ErrorKind, ReferenceGroup, ResolveError, Signature, group_references};
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Distinct references in flight at once.
    pub concurrency: usize,
    /// Upper bound on one handler call, cache lookups excluded.
    pub reference_timeout: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            reference_timeout: Duration::from_secs(45),
        }
    }
}

/// Whether cached content may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    #[default]
    Cached,
    /// Bypass cached content, re-fetch and replace entries whose content changed.
    Refresh,
}

/// What to purge with [`Resolver::invalidate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTarget {
    Signature(Signature),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceError {
    pub signature: Signature,
    pub raw_token: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Text shown next to the literal token.
    pub marker: String,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceTokens {
    pub signature: Signature,
    pub tokens: u32,
    /// Occurrences in the source text; the tokens are counted once regardless.
    pub occurrences: usize,
    pub approximate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionResult {
    pub resolved_content: String,
    /// Tokens in `resolved_content`.
    pub total_tokens: u32,
    /// Tokens in the source text with resolved reference spans removed.
    pub base_content_tokens: u32,
    /// One entry per distinct resolved reference, in first-occurrence order.
    pub per_reference_tokens: Vec<ReferenceTokens>,
    pub errors: Vec<ReferenceError>,
    /// True when any count above came from the heuristic estimate.
    pub approximate: bool,
}

impl ResolutionResult {
    /// Block aggregate: content tokens plus each distinct reference once.
    #[must_use]
    pub fn block_tokens(&self) -> u32 {
        self.per_reference_tokens
            .iter()
            .fold(self.base_content_tokens, |sum, r| sum.saturating_add(r.tokens))
    }
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    Storage(#[from] CacheError),
    #[error("all {} references failed to resolve", .result.errors.len())]
    AllReferencesFailed { result: Box<ResolutionResult> },
}

impl ResolutionError {
    /// The partial result, when there is one.
    #[must_use]
    pub fn partial(&self) -> Option<&ResolutionResult> {
        match self {
            ResolutionError::AllReferencesFailed { result } => Some(result),
            ResolutionError::Storage(_) => None,
        }
    }
}

/// Stored resolution, valid while the handler reports the same fingerprint.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResolution {
    fingerprint: String,
    resolved: Resolved,
}

pub struct Resolver {
    handlers: HandlerRegistry,
    cache: HierarchicalCache,
    tokens: CachedTokenCounter,
    options: ResolverOptions,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("handlers", &self.handlers)
            .field("cache", &self.cache)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    #[must_use]
    pub fn new(
        handlers: HandlerRegistry,
        cache: HierarchicalCache,
        tokens: CachedTokenCounter,
        options: ResolverOptions,
    ) -> Self {
        Self {
            handlers,
            cache,
            tokens,
            options,
        }
    }

    pub fn count_tokens(&self, text: &str) -> Result<TokenCountResult, CacheError> {
        self.tokens.count(text)
    }

    /// Purge resolution entries from both tiers. Returns how many were removed.
    pub fn invalidate(&self, target: &CacheTarget) -> Result<usize, CacheError> {
        match target {
            CacheTarget::Signature(signature) => {
                let removed = self.cache.invalidate(signature.as_str())?;
                tracing::info!(%signature, removed, "Invalidated cached reference");
                Ok(usize::from(removed))
            }
            CacheTarget::All => {
                let removed = self.cache.invalidate_all()?;
                tracing::info!(removed, "Invalidated all cached references");
                Ok(removed)
            }
        }
    }

    pub async fn resolve(
        &self,
        text: &str,
        snapshot: &Snapshot,
        mode: ResolveMode,
    ) -> Result<ResolutionResult, ResolutionError> {
        let groups = group_references(text);

        let lookups: Vec<_> = groups
            .iter()
            .enumerate()
            .map(|(index, group)| async move {
                (index, self.resolve_group(group, snapshot, mode).await)
            })
            .collect();
        let mut outcomes: Vec<(usize, Result<Resolved, ResolveError>)> =
            stream::iter(lookups)
                .buffer_unordered(self.options.concurrency.max(1))
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .map(|(index, outcome)| outcome.map(|resolved| (index, resolved)))
                .collect::<Result<_, CacheError>>()?;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut replacements: Vec<(Range<usize>, &str)> = Vec::new();
        let mut per_reference_tokens = Vec::new();
        let mut errors = Vec::new();
        let mut approximate = false;

        for ((_, outcome), group) in outcomes.iter().zip(&groups) {
            match outcome {
                Ok(resolved) => {
                    let count = self.tokens.count(&resolved.content)?;
                    approximate |= count.approximate;
                    per_reference_tokens.push(ReferenceTokens {
                        signature: group.signature.clone(),
                        tokens: count.count,
                        occurrences: group.spans.len(),
                        approximate: count.approximate,
                    });
                    replacements.extend(
                        group
                            .spans
                            .iter()
                            .map(|span| (span.clone(), resolved.content.as_str())),
                    );
                }
                Err(error) => errors.push(self.reference_error(group, error)),
            }
        }
        replacements.sort_by_key(|(span, _)| span.start);

        let resolved_content = splice(text, &replacements);
        let base_content = splice(
            text,
            &replacements
                .iter()
                .map(|(span, _)| (span.clone(), ""))
                .collect::<Vec<_>>(),
        );

        let total = self.tokens.count(&resolved_content)?;
        let base = self.tokens.count(&base_content)?;
        approximate |= total.approximate || base.approximate;

        let result = ResolutionResult {
            resolved_content,
            total_tokens: total.count,
            base_content_tokens: base.count,
            per_reference_tokens,
            errors,
            approximate,
        };

        tracing::debug!(
            references = groups.len(),
            failed = result.errors.len(),
            total_tokens = result.total_tokens,
            "Resolved text"
        );

        if !groups.is_empty() && result.errors.len() == groups.len() {
            return Err(ResolutionError::AllReferencesFailed {
                result: Box::new(result),
            });
        }
        Ok(result)
    }

    /// Outer error aborts the whole call; inner error belongs to this reference.
    async fn resolve_group(
        &self,
        group: &ReferenceGroup,
        snapshot: &Snapshot,
        mode: ResolveMode,
    ) -> Result<Result<Resolved, ResolveError>, CacheError> {
        let reference = &group.reference;
        let Some(handler) = self.handlers.get(reference.kind) else {
            return Ok(Err(ResolveError::NotResolvable {
                target: reference.raw_token.clone(),
                reason: format!("no handler registered for '{}' references", reference.kind),
            }));
        };
        // Runs the handler's validation, sandbox included, before any cache lookup.
        let fingerprint = match handler.fingerprint(reference, snapshot) {
            Ok(fingerprint) => fingerprint,
            Err(e) => return Ok(Err(e)),
        };

        let key = group.signature.as_str();
        let previous = match self.cache.get_json::<CachedResolution>(key)? {
            Some(entry) if mode == ResolveMode::Cached && entry.fingerprint == fingerprint => {
                return Ok(Ok(entry.resolved));
            }
            Some(entry) => {
                if mode == ResolveMode::Cached {
                    tracing::debug!(signature = %group.signature, "Cached reference is stale");
                }
                Some(entry.resolved)
            }
            None => None,
        };

        let timeout = self.options.reference_timeout;
        let fetched = match tokio::time::timeout(timeout, handler.resolve(reference, snapshot)).await
        {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout {
                operation: format!("resolving {}", reference.raw_token),
                after: timeout,
            }),
        };
        let resolved = match fetched {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!(signature = %group.signature, error = %e, "Reference failed");
                return Ok(Err(e));
            }
        };

        if let Some(previous) = previous {
            if content_hash(&previous.content) == content_hash(&resolved.content) {
                tracing::debug!(signature = %group.signature, "Refreshed reference unchanged");
            } else {
                tracing::info!(signature = %group.signature, "Refreshed reference changed");
            }
        }
        let entry = CachedResolution {
            fingerprint,
            resolved,
        };
        self.cache.put_json(key, &entry, handler.cache_ttl())?;
        Ok(Ok(entry.resolved))
    }

    fn reference_error(&self, group: &ReferenceGroup, error: &ResolveError) -> ReferenceError {
        let reference = &group.reference;
        let marker = match self.handlers.get(reference.kind) {
            Some(handler) => handler.describe_error(reference, error),
            None => format!("{} could not be resolved: {error}", reference.raw_token),
        };
        ReferenceError {
            signature: group.signature.clone(),
            raw_token: reference.raw_token.clone(),
            kind: error.kind(),
            message: error.to_string(),
            marker,
            transient: error.is_transient(),
        }
    }
}

/// Replace each span with its text. Spans must be sorted and non-overlapping.
fn splice(text: &str, replacements: &[(Range<usize>, &str)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, replacement) in replacements {
        out.push_str(&text[cursor..span.start]);
        out.push_str(replacement);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fenceref_context::{Namespace, TokenCounter};

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn resolve_future_is_send() {
        let resolver = Resolver::new(
            HandlerRegistry::default(),
            HierarchicalCache::new(Namespace::Resolution, 4, None),
            CachedTokenCounter::new(
                TokenCounter::default(),
                HierarchicalCache::new(Namespace::Tokens, 4, None),
                Duration::from_secs(60),
            ),
            ResolverOptions::default(),
        );
        let snapshot = Snapshot::default();
        let future = resolver.resolve("@[var:a] @[var:b]", &snapshot, ResolveMode::Refresh);
        assert_send(&future);
    }

    #[test]
    fn splice_replaces_in_order() {
        let text = "a @[x] b @[y] c";
        let out = splice(text, &[(2..6, "X"), (9..13, "Y")]);
        assert_eq!(out, "a X b Y c");
        assert_eq!(splice(text, &[]), text);
    }

    #[test]
    fn block_tokens_counts_each_reference_once() {
        let result = ResolutionResult {
            resolved_content: String::new(),
            total_tokens: 0,
            base_content_tokens: 5,
            per_reference_tokens: vec![
                ReferenceTokens {
                    signature: Signature::parse("var:a").unwrap(),
                    tokens: 3,
                    occurrences: 4,
                    approximate: false,
                },
                ReferenceTokens {
                    signature: Signature::parse("var:b").unwrap(),
                    tokens: 2,
                    occurrences: 1,
                    approximate: false,
                },
            ],
            errors: Vec::new(),
            approximate: false,
        };
        assert_eq!(result.block_tokens(), 10);
    }
}
