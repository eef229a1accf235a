//! Fence blocks as seen by the resolver: an id and raw content, nothing else.

use serde::{Deserialize, Serialize};

use crate::ids::BlockId;
use crate::parser::contains_references;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceBlock {
    pub id: BlockId,
    pub content: String,
}

impl FenceBlock {
    pub fn new(id: impl Into<BlockId>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn has_references(&self) -> bool {
        contains_references(&self.content)
    }
}
