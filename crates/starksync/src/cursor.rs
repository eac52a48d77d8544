//! In-memory cursor for the ingestion pipeline.
//!
//! Seeded from the persisted L1 checkpoint at startup; survives reconnects within a run and is
//! what keeps the backfill/live-tail boundary free of gaps and duplicates.

/// Position of a log on L1: `(block_number, log_index)`.
pub type LogPosition = (u64, u64);

/// Cursor: last fully processed block and last emitted log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub last_processed_block: u64,
    pub last_emitted: Option<LogPosition>,
}

impl Cursor {
    pub fn new(last_processed_block: u64) -> Self {
        Self {
            last_processed_block,
            last_emitted: None,
        }
    }

    /// First block not yet covered.
    pub fn next_block(&self) -> u64 {
        self.last_processed_block + 1
    }

    /// True if a log at `pos` was already handed downstream.
    pub fn already_emitted(&self, pos: LogPosition) -> bool {
        pos.0 <= self.last_processed_block || self.last_emitted.is_some_and(|last| pos <= last)
    }

    pub fn record_emitted(&mut self, pos: LogPosition) {
        self.last_emitted = Some(pos);
    }

    /// Mark every block up to `block` as complete. Returns false if nothing moved.
    pub fn complete_through(&mut self, block: u64) -> bool {
        if block <= self.last_processed_block {
            return false;
        }
        self.last_processed_block = block;
        true
    }
}
