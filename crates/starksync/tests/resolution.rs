//! Fact resolution: ledger dispatch, ordering, and the full synchronizer over fakes.

mod common;

use alloy::primitives::{Bytes, B256};
use common::*;
use starksync::store::{StoreError, WriteBatch, WriteOp};
use starksync::{
    decode_log, Checkpoint, Dispatcher, FactLedger, FactResolver, FactStatus, IngestMessage,
    KeyValueStore, MaterializerConfig, MemoryStore, RawLog, ResolutionConfig, ResolvedFact,
    StateMaterializer, SyncConfig, SyncContext, Synchronizer, WatchedContracts,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    store: Arc<MemoryStore>,
    l1: Arc<FakeL1>,
    ledger: Arc<FactLedger>,
    dispatcher: Dispatcher,
    resolver: FactResolver,
    resolved: mpsc::Receiver<ResolvedFact>,
}

impl Harness {
    fn new(strict_order: bool) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let l1 = Arc::new(FakeL1::new(5, 1_000));
        let ledger = Arc::new(FactLedger::load(store.clone(), strict_order).unwrap());
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            Checkpoint::l1(store.clone()),
            CancellationToken::new(),
        );
        let (tx, resolved) = mpsc::channel(16);
        let config = ResolutionConfig {
            poll_interval: Duration::from_millis(10),
            strict_order,
        };
        let resolver = FactResolver::new(
            ledger.clone(),
            l1.clone(),
            config,
            tx,
            CancellationToken::new(),
        );
        Self {
            store,
            l1,
            ledger,
            dispatcher,
            resolver,
            resolved,
        }
    }

    async fn ingest(&self, log: RawLog) {
        let event = decode_log(&log, &contracts()).unwrap();
        self.dispatcher.handle(IngestMessage::Event(event)).await;
    }

    /// Register `page` as carried by a transaction whose input is `data`.
    async fn register_page(&self, block: u64, page: B256, tx: B256, data: &[u8]) {
        self.l1.add_transaction(tx, data.to_vec());
        self.ingest(page_log(block, 0, page, tx)).await;
    }

    fn status(&self, fact: B256) -> FactStatus {
        self.ledger.status(&fact).unwrap()
    }
}

fn b(n: u8) -> B256 {
    B256::repeat_byte(n)
}

#[tokio::test]
async fn fact_resolves_only_once_every_dependency_is_known() {
    let mut h = Harness::new(true);
    let fact = b(1);

    h.ingest(fact_log(100, 0, fact)).await;
    assert_eq!(h.status(fact), FactStatus::Observed);
    assert_eq!(h.resolver.drain().await.unwrap(), 0);

    h.ingest(pages_log(101, 0, fact, vec![b(0xa1), b(0xa2)])).await;
    assert_eq!(h.status(fact), FactStatus::PagesKnown);
    assert_eq!(h.resolver.drain().await.unwrap(), 0);

    h.register_page(102, b(0xa2), b(0xc2), &[2, 2]).await;
    assert_eq!(h.resolver.drain().await.unwrap(), 0);
    // Nothing is fetched while any page is still missing its transaction.
    assert_eq!(h.l1.tx_lookups.load(Ordering::SeqCst), 0);

    h.register_page(103, b(0xa1), b(0xc1), &[1, 1, 1]).await;
    assert_eq!(h.resolver.drain().await.unwrap(), 1);
    assert_eq!(h.l1.tx_lookups.load(Ordering::SeqCst), 2);

    let resolved = h.resolved.try_recv().unwrap();
    assert_eq!(resolved.fact, fact);
    let pages: Vec<(B256, B256, Bytes)> = resolved
        .pages
        .into_iter()
        .map(|p| (p.hash, p.tx_hash, p.data))
        .collect();
    assert_eq!(
        pages,
        vec![
            (b(0xa1), b(0xc1), Bytes::from(vec![1, 1, 1])),
            (b(0xa2), b(0xc2), Bytes::from(vec![2, 2])),
        ]
    );
    assert_eq!(h.status(fact), FactStatus::Resolved);
    assert!(h.ledger.pending().is_empty());
}

#[tokio::test]
async fn dependencies_may_arrive_before_the_fact() {
    let mut h = Harness::new(true);
    let fact = b(1);
    h.register_page(100, b(0xa1), b(0xc1), &[7]).await;
    h.ingest(pages_log(101, 0, fact, vec![b(0xa1)])).await;
    assert_eq!(h.status(fact), FactStatus::Unknown);
    assert_eq!(h.resolver.drain().await.unwrap(), 0);

    h.ingest(fact_log(102, 0, fact)).await;
    assert_eq!(h.resolver.drain().await.unwrap(), 1);
    assert_eq!(h.resolved.try_recv().unwrap().fact, fact);
}

#[tokio::test]
async fn strict_order_holds_back_later_ready_facts() {
    let mut h = Harness::new(true);
    let (first, second) = (b(1), b(2));
    h.ingest(fact_log(100, 0, first)).await;
    h.ingest(fact_log(100, 1, second)).await;
    h.ingest(pages_log(101, 0, second, vec![b(0xa2)])).await;
    h.register_page(101, b(0xa2), b(0xc2), &[2]).await;

    assert_eq!(h.resolver.drain().await.unwrap(), 0);
    assert_eq!(h.status(second), FactStatus::PagesKnown);

    h.ingest(pages_log(102, 0, first, vec![b(0xa1)])).await;
    h.register_page(102, b(0xa1), b(0xc1), &[1]).await;
    // One pass resolves the head and then everything ready behind it.
    assert_eq!(h.resolver.drain().await.unwrap(), 2);
    assert_eq!(h.resolved.try_recv().unwrap().fact, first);
    assert_eq!(h.resolved.try_recv().unwrap().fact, second);
}

#[tokio::test]
async fn relaxed_order_lets_ready_facts_overtake() {
    let mut h = Harness::new(false);
    let (first, second) = (b(1), b(2));
    h.ingest(fact_log(100, 0, first)).await;
    h.ingest(fact_log(100, 1, second)).await;
    h.ingest(pages_log(101, 0, second, vec![b(0xa2)])).await;
    h.register_page(101, b(0xa2), b(0xc2), &[2]).await;

    assert_eq!(h.resolver.drain().await.unwrap(), 1);
    assert_eq!(h.resolved.try_recv().unwrap().fact, second);
    assert_eq!(h.status(first), FactStatus::Observed);
    assert_eq!(h.ledger.pending(), vec![first]);
}

#[tokio::test]
async fn missing_transaction_returns_fact_to_the_queue() {
    let mut h = Harness::new(true);
    let fact = b(1);
    h.ingest(fact_log(100, 0, fact)).await;
    h.ingest(pages_log(100, 1, fact, vec![b(0xa1)])).await;
    // Page registered, but the node does not know the carrying transaction yet.
    h.ingest(page_log(100, 2, b(0xa1), b(0xc1))).await;

    assert_eq!(h.resolver.drain().await.unwrap(), 0);
    assert_eq!(h.status(fact), FactStatus::PagesKnown);
    assert!(h.resolved.try_recv().is_err());

    h.l1.add_transaction(b(0xc1), vec![9]);
    assert_eq!(h.resolver.drain().await.unwrap(), 1);
    assert_eq!(h.status(fact), FactStatus::Resolved);
}

#[tokio::test]
async fn relaxed_order_moves_past_a_missing_transaction() {
    let mut h = Harness::new(false);
    let (stuck, ready) = (b(1), b(2));
    h.ingest(fact_log(100, 0, stuck)).await;
    h.ingest(fact_log(100, 1, ready)).await;
    h.ingest(pages_log(101, 0, stuck, vec![b(0xa1)])).await;
    h.ingest(pages_log(101, 1, ready, vec![b(0xa2)])).await;
    // The node never learns the first carrying transaction.
    h.ingest(page_log(102, 0, b(0xa1), b(0xc1))).await;
    h.register_page(102, b(0xa2), b(0xc2), &[2]).await;

    assert_eq!(h.resolver.drain().await.unwrap(), 1);
    assert_eq!(h.resolved.try_recv().unwrap().fact, ready);
    assert_eq!(h.status(stuck), FactStatus::PagesKnown);
    assert_eq!(h.status(ready), FactStatus::Resolved);
    assert_eq!(h.ledger.pending(), vec![stuck]);
}

/// Memory store rejecting every ledger write.
#[derive(Default)]
struct ReadOnlyLedgerStore {
    inner: MemoryStore,
}

fn ledger_key(key: &[u8]) -> bool {
    key.starts_with(b"ledger/")
}

fn rejected() -> StoreError {
    StoreError::Backend("disk full".into())
}

impl KeyValueStore for ReadOnlyLedgerStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if ledger_key(key) {
            return Err(rejected());
        }
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        if ledger_key(key) {
            return Err(rejected());
        }
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.inner.scan_prefix(prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let touches_ledger = batch.ops().iter().any(|op| match op {
            WriteOp::Put(key, _) | WriteOp::Delete(key) => ledger_key(key),
        });
        if touches_ledger {
            return Err(rejected());
        }
        self.inner.write_batch(batch)
    }
}

#[tokio::test]
async fn cancellation_stops_a_dispatcher_stuck_on_ledger_writes() {
    init_tracing();
    let store = Arc::new(ReadOnlyLedgerStore::default());
    let ledger = Arc::new(FactLedger::load(store.clone(), true).unwrap());
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(ledger.clone(), Checkpoint::l1(store.clone()), cancel.clone());
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn(dispatcher.run(rx));

    let event = decode_log(&fact_log(100, 0, b(1)), &contracts()).unwrap();
    tx.send(IngestMessage::Event(event)).await.unwrap();
    tx.send(IngestMessage::Synced(150)).await.unwrap();
    drop(tx);
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    tokio_test::assert_ok!(tokio::time::timeout(WAIT, task).await.unwrap());
    // The marker behind the unapplied event is never checkpointed.
    assert_eq!(Checkpoint::l1(store.clone()).load().unwrap(), 0);
    assert!(ledger.pending().is_empty());
}

#[tokio::test]
async fn resolved_fact_is_not_queued_again() {
    let mut h = Harness::new(true);
    let fact = b(1);
    h.ingest(fact_log(100, 0, fact)).await;
    h.ingest(pages_log(100, 1, fact, vec![b(0xa1)])).await;
    h.register_page(100, b(0xa1), b(0xc1), &[1]).await;
    assert_eq!(h.resolver.drain().await.unwrap(), 1);
    h.resolved.try_recv().unwrap();

    // A replayed log after a restart.
    h.ingest(fact_log(100, 0, fact)).await;
    assert_eq!(h.status(fact), FactStatus::Resolved);
    assert_eq!(h.resolver.drain().await.unwrap(), 0);

    // The same holds for a ledger reopened over the store.
    let reopened = FactLedger::load(h.store.clone(), true).unwrap();
    assert!(reopened.pending().is_empty());
    assert_eq!(reopened.status(&fact).unwrap(), FactStatus::Resolved);
}

#[tokio::test]
async fn sync_markers_advance_the_l1_checkpoint() {
    let h = Harness::new(true);
    let checkpoint = Checkpoint::l1(h.store.clone());
    h.dispatcher.handle(IngestMessage::Synced(150)).await;
    assert_eq!(checkpoint.load().unwrap(), 150);
    // Stale markers never move it back.
    h.dispatcher.handle(IngestMessage::Synced(120)).await;
    assert_eq!(checkpoint.load().unwrap(), 150);
}

#[tokio::test]
async fn discovery_uses_feeder_and_chain_id() {
    let l1 = FakeL1::new(1, 0);
    let feeder = FakeFeeder::new();
    let found = WatchedContracts::discover(&l1, &feeder).await.unwrap();
    assert_eq!(found.state, contracts().state);
    assert_eq!(found.deployment_block, 13_627_000);
}

#[tokio::test]
async fn synchronizer_resolves_facts_and_applies_state() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let l1 = Arc::new(FakeL1::new(5, 200));
    let feeder = Arc::new(FakeFeeder::new());

    let fact = b(1);
    let (page_a, page_b) = (b(0xa1), b(0xa2));
    l1.add_log(fact_log(150, 0, fact));
    l1.add_log(pages_log(151, 0, fact, vec![page_a, page_b]));
    l1.add_log(page_log(152, 0, page_a, b(0xc1)));
    l1.add_log(page_log(152, 1, page_b, b(0xc2)));
    l1.add_transaction(b(0xc1), vec![0xaa]);
    l1.add_transaction(b(0xc2), vec![0xbb, 0xbb]);
    feeder.add_update(0, state_update(0, &[("0x20", "0xabc")], &[("0x20", &[("0x1", "0x2")])]));

    let mut config = SyncConfig::new("http://fake", "http://fake");
    config.l1 = l1_config(50);
    config.resolution.poll_interval = Duration::from_millis(10);
    config.materializer = MaterializerConfig {
        poll_interval: Duration::from_millis(10),
        store_blocks: false,
        retry_backoff: Duration::from_millis(10),
    };
    let ctx = SyncContext::new(store.clone(), l1.clone(), feeder.clone(), config);
    let handle = Synchronizer::start_with(ctx, contracts()).unwrap();

    assert!(wait_for(WAIT, || handle.ledger().status(&fact).ok() == Some(FactStatus::Resolved)).await);

    let reader = StateMaterializer::new(store.clone(), feeder.clone(), MaterializerConfig::default());
    assert!(wait_for(WAIT, || reader.memory_page(&page_b).ok().flatten().is_some()).await);
    assert_eq!(reader.memory_page(&page_a).unwrap(), Some(vec![0xaa]));
    assert_eq!(reader.memory_page(&page_b).unwrap(), Some(vec![0xbb, 0xbb]));
    assert!(wait_for(WAIT, || reader.next_block().ok() == Some(1)).await);
    assert!(wait_for(WAIT, || Checkpoint::l1(store.clone()).load().ok() == Some(200)).await);
    assert!(handle.is_running());

    tokio_test::assert_ok!(handle.shutdown().await);
    assert!(store.get(b"latestStateUpdateApplied").unwrap().is_some());
}
