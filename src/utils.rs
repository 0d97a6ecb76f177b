// src/utils.rs
// Block range helpers shared by the endpoint and the profit windows

use crate::chains::Chain;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Creates a vector of inclusive `(start_block, end_block)` tuples covering
/// `from_block..=to_block` in chunks of at most `chunk_size` blocks.
/// Empty when the range is inverted.
pub fn create_block_chunks(from_block: u64, to_block: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current_from = from_block;
    while current_from <= to_block {
        let current_to = std::cmp::min(current_from.saturating_add(chunk_size - 1), to_block);
        chunks.push((current_from, current_to));
        if current_to == u64::MAX {
            break;
        }
        current_from = current_to + 1;
    }
    chunks
}

/// Look-back window for profit and yield queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePeriod {
    OneDay,
    SevenDays,
    ThirtyDays,
}

impl TimePeriod {
    pub fn days(&self) -> u64 {
        match self {
            TimePeriod::OneDay => 1,
            TimePeriod::SevenDays => 7,
            TimePeriod::ThirtyDays => 30,
        }
    }

    /// Approximate start block of the window ending at `to_block`.
    pub fn from_block(&self, chain: Chain, to_block: u64) -> u64 {
        to_block.saturating_sub(chain.average_blocks_per_day() * self.days())
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d", self.days())
    }
}
