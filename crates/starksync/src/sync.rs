//! Wiring: the shared context and the task set that makes up a running synchronizer.

use crate::checkpoint::Checkpoint;
use crate::client::L1Client;
use crate::config::SyncConfig;
use crate::feeder::{FeederClient, FeederGatewayClient};
use crate::indexer::{IngestError, IngestionPipeline};
use crate::ledger::{FactLedger, LedgerError};
use crate::materializer::{MaterializeError, StateMaterializer};
use crate::network::{DiscoveryError, WatchedContracts};
use crate::resolver::{Dispatcher, FactResolver, ResolveError};
use crate::rpc::JsonRpcClient;
use crate::store::{KeyValueStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collaborators shared by every task, built once at startup.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn KeyValueStore>,
    pub l1: Arc<dyn L1Client>,
    pub feeder: Arc<dyn FeederClient>,
    pub config: SyncConfig,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        l1: Arc<dyn L1Client>,
        feeder: Arc<dyn FeederClient>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            l1,
            feeder,
            config,
        }
    }

    /// Context backed by the JSON-RPC L1 client and the feeder gateway HTTP client.
    pub fn connect(store: Arc<dyn KeyValueStore>, config: SyncConfig) -> Self {
        let l1 = Arc::new(JsonRpcClient::from_config(&config.l1));
        let feeder = Arc::new(FeederGatewayClient::new(config.feeder_url.clone()));
        Self::new(store, l1, feeder, config)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error("task {0} panicked")]
    Panicked(&'static str),
}

pub struct Synchronizer;

impl Synchronizer {
    /// Discover the watched contracts and start all tasks.
    pub async fn start(ctx: SyncContext) -> Result<SyncHandle, SyncError> {
        let contracts = WatchedContracts::discover(ctx.l1.as_ref(), ctx.feeder.as_ref()).await?;
        Self::start_with(ctx, contracts)
    }

    /// Start all tasks against known contracts.
    pub fn start_with(ctx: SyncContext, contracts: WatchedContracts) -> Result<SyncHandle, SyncError> {
        let cancel = CancellationToken::new();
        let l1_checkpoint = Checkpoint::l1(ctx.store.clone());
        let checkpoint = l1_checkpoint.load()?;
        let ledger = Arc::new(FactLedger::load(
            ctx.store.clone(),
            ctx.config.resolution.strict_order,
        )?);

        let (event_tx, event_rx) = mpsc::channel(ctx.config.channel_capacity);
        let (resolved_tx, resolved_rx) = mpsc::channel(ctx.config.channel_capacity);

        let pipeline = IngestionPipeline::new(
            ctx.l1.clone(),
            contracts,
            ctx.config.l1.clone(),
            event_tx,
            cancel.child_token(),
        );
        let dispatcher = Dispatcher::new(ledger.clone(), l1_checkpoint, cancel.child_token());
        let resolver = FactResolver::new(
            ledger.clone(),
            ctx.l1.clone(),
            ctx.config.resolution.clone(),
            resolved_tx,
            cancel.child_token(),
        );
        let materializer = StateMaterializer::new(
            ctx.store.clone(),
            ctx.feeder.clone(),
            ctx.config.materializer.clone(),
        );

        tracing::info!(checkpoint, pending = ledger.pending().len(), "synchronizer starting");
        Ok(SyncHandle {
            ingestion: tokio::spawn(pipeline.run(checkpoint)),
            dispatcher: tokio::spawn(dispatcher.run(event_rx)),
            resolver: tokio::spawn(resolver.run()),
            materializer: tokio::spawn(materializer.run(resolved_rx, cancel.child_token())),
            ledger,
            cancel,
        })
    }
}

/// Running synchronizer.
pub struct SyncHandle {
    ingestion: JoinHandle<Result<(), IngestError>>,
    dispatcher: JoinHandle<()>,
    resolver: JoinHandle<Result<(), ResolveError>>,
    materializer: JoinHandle<Result<(), MaterializeError>>,
    ledger: Arc<FactLedger>,
    cancel: CancellationToken,
}

impl SyncHandle {
    pub fn ledger(&self) -> &Arc<FactLedger> {
        &self.ledger
    }

    /// False once any task has exited, e.g. after a fatal error.
    pub fn is_running(&self) -> bool {
        !(self.ingestion.is_finished()
            || self.dispatcher.is_finished()
            || self.resolver.is_finished()
            || self.materializer.is_finished())
    }

    /// Token cancelled by [SyncHandle::shutdown]; tasks stop when it fires.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for them. The dispatcher finishes applying whatever ingestion
    /// already emitted before this returns. The first task error, if any, is returned.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        self.cancel.cancel();
        let ingestion = join("ingestion", self.ingestion).await;
        // The pipeline dropped its sender, so the dispatcher drains and exits.
        let dispatcher = join("dispatcher", self.dispatcher).await;
        let resolver = join("resolver", self.resolver).await;
        let materializer = join("materializer", self.materializer).await;
        tracing::info!("synchronizer stopped");

        ingestion??;
        dispatcher?;
        resolver??;
        materializer??;
        Ok(())
    }
}

async fn join<T>(name: &'static str, handle: JoinHandle<T>) -> Result<T, SyncError> {
    handle.await.map_err(|e| {
        tracing::error!(task = name, reason = %e, "task failed");
        SyncError::Panicked(name)
    })
}
