//! Fact resolution tasks.
//!
//! - [Dispatcher]: applies ingested events to the [FactLedger] and saves the L1 checkpoint when a
//!   `Synced` marker shows everything before it is durable.
//! - [FactResolver]: on a fixed interval, keeps claiming ready facts, fetches the transactions
//!   carrying their pages (outside the ledger lock) and hands the pages downstream.

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::client::{ClientError, L1Client};
use crate::config::ResolutionConfig;
use crate::indexer::IngestMessage;
use crate::ledger::{FactLedger, LedgerError, ReadyFact};
use alloy::primitives::{Bytes, B256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Delay before re-applying an event whose ledger write failed.
const LEDGER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One page of program memory, taken from its carrying transaction's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPage {
    pub hash: B256,
    pub tx_hash: B256,
    pub data: Bytes,
}

/// A fact together with all of its pages, in page order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFact {
    pub fact: B256,
    pub pages: Vec<MemoryPage>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("transaction {tx} carrying page {page} not found")]
    MissingTransaction { page: B256, tx: B256 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("resolved fact channel closed")]
    ChannelClosed,
}

/// Event-to-ledger dispatch loop.
pub struct Dispatcher {
    ledger: Arc<FactLedger>,
    checkpoint: Checkpoint,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(ledger: Arc<FactLedger>, checkpoint: Checkpoint, cancel: CancellationToken) -> Self {
        Self {
            ledger,
            checkpoint,
            cancel,
        }
    }

    /// Consume until the ingestion side closes the channel. Every received message is applied
    /// before returning, so shutdown drains in-flight events. Stops early when cancelled while an
    /// event cannot be written; nothing after that event is checkpointed.
    pub async fn run(self, mut rx: mpsc::Receiver<IngestMessage>) {
        while let Some(msg) = rx.recv().await {
            if !self.handle(msg).await {
                tracing::warn!("dispatcher cancelled with an unapplied event");
                return;
            }
        }
        tracing::info!("dispatcher drained");
    }

    /// Apply one message. Returns `false` if cancellation interrupted the write of an event.
    pub async fn handle(&self, msg: IngestMessage) -> bool {
        match msg {
            IngestMessage::Event(event) => {
                // The event must land before any later marker can be checkpointed.
                while let Err(e) = self.ledger.apply(&event) {
                    tracing::warn!(
                        reason = %e,
                        block = event.origin().block_number,
                        tx = %event.origin().transaction_hash,
                        "ledger write failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = sleep(LEDGER_RETRY_DELAY) => {}
                    }
                }
            }
            IngestMessage::Synced(height) => match self.checkpoint.save(height) {
                Ok(()) => {}
                Err(CheckpointError::Regression { current, .. }) => {
                    tracing::debug!(height, current, "stale sync marker ignored");
                }
                // A later marker will save a higher height.
                Err(e) => tracing::warn!(height, reason = %e, "L1 checkpoint not saved"),
            },
        }
        true
    }
}

/// Background poller resolving facts into memory pages.
pub struct FactResolver {
    ledger: Arc<FactLedger>,
    l1: Arc<dyn L1Client>,
    config: ResolutionConfig,
    tx: mpsc::Sender<ResolvedFact>,
    cancel: CancellationToken,
}

impl FactResolver {
    pub fn new(
        ledger: Arc<FactLedger>,
        l1: Arc<dyn L1Client>,
        config: ResolutionConfig,
        tx: mpsc::Sender<ResolvedFact>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            l1,
            config,
            tx,
            cancel,
        }
    }

    /// Poll until cancelled. Only a closed downstream channel stops it early.
    pub async fn run(self) -> Result<(), ResolveError> {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            match self.drain().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(resolved = n, "resolution pass done"),
                Err(e) => {
                    tracing::error!(reason = %e, "resolver stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Resolve ready facts until none is left. A fact whose pages cannot be fetched goes back to
    /// the queue and is retried on the next tick. In strict order it ends the pass; otherwise the
    /// pass moves on to the next ready fact.
    pub async fn drain(&self) -> Result<usize, ResolveError> {
        let mut resolved = 0;
        let mut failed = HashSet::new();
        while let Some(ready) = self.ledger.next_ready_except(&failed) {
            let fact = ready.fact;
            let pages = match self.fetch_pages(&ready).await {
                Ok(pages) => pages,
                Err(e) => {
                    tracing::warn!(fact = %fact, reason = %e, "fact resolution failed, will retry");
                    self.ledger.abandon(fact);
                    if self.config.strict_order || !failed.insert(fact) {
                        break;
                    }
                    continue;
                }
            };
            let page_count = pages.len();
            let sent = tokio::select! {
                r = self.tx.send(ResolvedFact { fact, pages }) => r.is_ok(),
                _ = self.cancel.cancelled() => false,
            };
            if !sent {
                self.ledger.abandon(fact);
                if self.cancel.is_cancelled() {
                    return Ok(resolved);
                }
                return Err(ResolveError::ChannelClosed);
            }
            if let Err(e) = self.ledger.complete(fact) {
                // Delivered but not marked: a retry re-delivers the same pages.
                tracing::warn!(fact = %fact, reason = %e, "could not mark fact resolved");
                self.ledger.abandon(fact);
                break;
            }
            tracing::info!(fact = %fact, pages = page_count, "fact resolved");
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn fetch_pages(&self, ready: &ReadyFact) -> Result<Vec<MemoryPage>, ResolveError> {
        let mut pages = Vec::with_capacity(ready.pages.len());
        for &(page, tx) in &ready.pages {
            let transaction = self
                .l1
                .transaction_by_hash(tx)
                .await?
                .ok_or(ResolveError::MissingTransaction { page, tx })?;
            pages.push(MemoryPage {
                hash: page,
                tx_hash: tx,
                data: transaction.input,
            });
        }
        Ok(pages)
    }
}
