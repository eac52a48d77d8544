//! Event ingestion: backfill the watched contracts' logs in bounded windows, then live-tail them.
//!
//! Output is a single ordered channel of [IngestMessage]s. `Synced(h)` follows every event at or
//! below `h`, so a consumer that has durably applied everything before the marker may checkpoint
//! `h`. Log positions already handed downstream are never emitted twice, which keeps the
//! backfill/live boundary free of gaps and duplicates across reconnects.

use crate::abi::{decode_log, watched_topics, L1Event, RawLog};
use crate::client::{ClientError, L1Client, LogFilter};
use crate::config::L1Config;
use crate::cursor::Cursor;
use crate::network::WatchedContracts;
use futures_util::StreamExt;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// One item on the ingestion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestMessage {
    Event(L1Event),
    /// Every log at or below this L1 block has been emitted.
    Synced(u64),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: ClientError,
    },
    #[error("ingestion channel closed")]
    ChannelClosed,
    #[error("cancelled")]
    Cancelled,
}

impl IngestError {
    /// Fatal errors stop the pipeline; the rest trigger a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::RetriesExhausted { .. } | IngestError::ChannelClosed
        )
    }
}

/// First block to scan given the deployment floor and the persisted L1 checkpoint (0 = none).
pub fn start_block(deployment_block: u64, checkpoint: u64) -> u64 {
    if checkpoint == 0 {
        deployment_block
    } else {
        deployment_block.max(checkpoint + 1)
    }
}

/// Backfill + live-tail over the three watched contracts.
pub struct IngestionPipeline {
    l1: Arc<dyn L1Client>,
    contracts: WatchedContracts,
    config: L1Config,
    filter: LogFilter,
    tx: mpsc::Sender<IngestMessage>,
    cancel: CancellationToken,
}

impl IngestionPipeline {
    pub fn new(
        l1: Arc<dyn L1Client>,
        contracts: WatchedContracts,
        config: L1Config,
        tx: mpsc::Sender<IngestMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let filter = LogFilter::new(contracts.addresses(), watched_topics());
        Self {
            l1,
            contracts,
            config,
            filter,
            tx,
            cancel,
        }
    }

    /// Run until cancelled or a fatal error. `checkpoint` is the last fully ingested L1 block.
    pub async fn run(self, checkpoint: u64) -> Result<(), IngestError> {
        let first = start_block(self.contracts.deployment_block, checkpoint);
        let mut cursor = Cursor::new(first.saturating_sub(1));
        let mut failures = 0u32;
        tracing::info!(from = first, checkpoint, "ingestion starting");

        loop {
            match self.run_once(&mut cursor, &mut failures).await {
                Ok(()) | Err(IngestError::Cancelled) => {
                    tracing::info!(block = cursor.last_processed_block, "ingestion stopped");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(reason = %e, block = cursor.last_processed_block, "ingestion halted");
                    return Err(e);
                }
                Err(e) => {
                    failures += 1;
                    let base = self.config.reconnection.backoff(failures);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    tracing::warn!(reason = %e, failures, delay = ?(base + jitter), "live tail failed, reconnecting...");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = sleep(base + jitter) => {}
                    }
                }
            }
        }
    }

    /// One connection lifetime: backfill to the tip, subscribe, catch up, tail. A connection that
    /// reaches the tail clears `failures`.
    async fn run_once(&self, cursor: &mut Cursor, failures: &mut u32) -> Result<(), IngestError> {
        let tip = self.with_retry("eth_blockNumber", || self.l1.block_number()).await?;
        self.backfill(cursor, tip).await?;

        // Subscribe before the catch-up query so no block falls between the two.
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
            s = self.l1.subscribe_logs(&self.filter) => s?,
        };
        let tip = self.with_retry("eth_blockNumber", || self.l1.block_number()).await?;
        self.backfill(cursor, tip).await?;
        *failures = 0;
        tracing::info!(block = cursor.last_processed_block, "live tail following");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(log)) => self.handle_live_log(cursor, log).await?,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::SubscriptionClosed.into()),
            }
        }
    }

    /// Scan `[cursor.next_block(), tip]` in windows, emitting a `Synced` marker after each.
    async fn backfill(&self, cursor: &mut Cursor, tip: u64) -> Result<(), IngestError> {
        let mut from = cursor.next_block();
        if from > tip {
            return Ok(());
        }
        tracing::info!(from, to = tip, "backfill starting");
        let width = self.config.window_size.max(1);
        while from <= tip {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let to = from.saturating_add(width - 1).min(tip);
            let window = self.filter.range(from, to);
            let mut logs = self
                .with_retry("eth_getLogs", || self.l1.filter_logs(&window))
                .await?;
            logs.sort_by_key(RawLog::position);
            let raw_count = logs.len();
            let mut emitted = 0usize;
            for log in logs {
                if self.emit(cursor, log).await? {
                    emitted += 1;
                }
            }
            if raw_count > 0 && emitted == 0 {
                tracing::warn!(raw_count, from, to, "backfill: logs received but none decoded");
            } else {
                tracing::debug!(count = emitted, from, to, "backfill window done");
            }
            cursor.complete_through(to);
            self.send(IngestMessage::Synced(to)).await?;
            from = to + 1;
        }
        tracing::info!(block = tip, "backfill reached tip");
        Ok(())
    }

    async fn handle_live_log(&self, cursor: &mut Cursor, log: RawLog) -> Result<(), IngestError> {
        if log.removed {
            tracing::warn!(block = log.block_number, tx = %log.transaction_hash, "removed log skipped");
            return Ok(());
        }
        // A log in a later block means every earlier block has been delivered.
        let completed = log.block_number.saturating_sub(1);
        if cursor.complete_through(completed) {
            self.send(IngestMessage::Synced(completed)).await?;
        }
        self.emit(cursor, log).await?;
        Ok(())
    }

    /// Decode and forward one log unless it was already emitted. Returns whether an event was sent.
    async fn emit(&self, cursor: &mut Cursor, log: RawLog) -> Result<bool, IngestError> {
        let pos = log.position();
        if log.removed || cursor.already_emitted(pos) {
            return Ok(false);
        }
        let sent = match decode_log(&log, &self.contracts) {
            Ok(event) => {
                self.send(IngestMessage::Event(event)).await?;
                true
            }
            Err(e) => {
                tracing::debug!(block = pos.0, log_index = pos.1, reason = %e, "decode log skipped");
                false
            }
        };
        cursor.record_emitted(pos);
        Ok(sent)
    }

    async fn send(&self, msg: IngestMessage) -> Result<(), IngestError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            r = self.tx.send(msg) => r.map_err(|_| IngestError::ChannelClosed),
        }
    }

    /// Bounded retry with exponential backoff; exhausting it is fatal.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= retry.max_attempts => {
                    return Err(IngestError::RetriesExhausted {
                        operation,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(operation, attempt, reason = %e, ?delay, "L1 query failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
