//! Registered fence blocks and their token totals.
//!
//! The global total is the sum of the latest per-block totals. A block whose
//! count drops to zero leaves the totals but stays registered, so it can be
//! refreshed again once it has content.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use fenceref_types::{BlockId, FenceBlock};

use crate::resolver::ResolutionResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub id: BlockId,
    pub total_tokens: u32,
    pub base_content_tokens: u32,
    pub reference_tokens: u32,
    pub distinct_references: usize,
    pub failed_references: usize,
    pub approximate: bool,
    pub counted_at: DateTime<Utc>,
}

impl BlockSummary {
    #[must_use]
    pub fn from_result(id: BlockId, result: &ResolutionResult) -> Self {
        let total_tokens = result.block_tokens();
        Self {
            id,
            total_tokens,
            base_content_tokens: result.base_content_tokens,
            reference_tokens: total_tokens.saturating_sub(result.base_content_tokens),
            distinct_references: result.per_reference_tokens.len() + result.errors.len(),
            failed_references: result.errors.len(),
            approximate: result.approximate,
            counted_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct BlockEntry {
    content: String,
    summary: Option<BlockSummary>,
}

#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: Mutex<BTreeMap<BlockId, BlockEntry>>,
}

impl BlockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn blocks(&self) -> MutexGuard<'_, BTreeMap<BlockId, BlockEntry>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a block. Replacing content clears its previous total.
    pub fn register(&self, block: FenceBlock) {
        let mut blocks = self.blocks();
        match blocks.get_mut(&block.id) {
            Some(entry) if entry.content == block.content => {}
            Some(entry) => {
                entry.content = block.content;
                entry.summary = None;
            }
            None => {
                blocks.insert(
                    block.id,
                    BlockEntry {
                        content: block.content,
                        summary: None,
                    },
                );
            }
        }
    }

    pub fn remove(&self, id: &BlockId) -> bool {
        self.blocks().remove(id).is_some()
    }

    #[must_use]
    pub fn content(&self, id: &BlockId) -> Option<String> {
        self.blocks().get(id).map(|entry| entry.content.clone())
    }

    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks().contains_key(id)
    }

    /// Store a fresh total. A zero total clears the block's summary.
    pub fn record(&self, summary: BlockSummary) {
        let mut blocks = self.blocks();
        let Some(entry) = blocks.get_mut(&summary.id) else {
            return;
        };
        if summary.total_tokens == 0 {
            tracing::debug!(block = %summary.id, "Block is empty; dropped from totals");
            entry.summary = None;
        } else {
            entry.summary = Some(summary);
        }
    }

    #[must_use]
    pub fn summary(&self, id: &BlockId) -> Option<BlockSummary> {
        self.blocks().get(id).and_then(|entry| entry.summary.clone())
    }

    /// Latest summaries in block id order.
    #[must_use]
    pub fn summaries(&self) -> Vec<BlockSummary> {
        self.blocks()
            .values()
            .filter_map(|entry| entry.summary.clone())
            .collect()
    }

    #[must_use]
    pub fn global_total(&self) -> u64 {
        self.blocks()
            .values()
            .filter_map(|entry| entry.summary.as_ref())
            .map(|summary| u64::from(summary.total_tokens))
            .sum()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<BlockId> {
        self.blocks().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks().is_empty()
    }
}
