//! End-to-end scenarios for the log poller against the in-memory chain and
//! store.
//!
//! Each test drives the poller tick by tick with `poll_once`, except where a
//! running loop is needed (replays, concurrent readers, the backup poller).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chainpoll_core::mock::{MockChainClient, MockHeads};
use chainpoll_core::store::memory::MemoryChainStore;
use chainpoll_core::{
    ChainId, Confirmations, Filter, FinalityMode, HeadSource, HeadTracker, HeadTrackerConfig, Log, LogPoller, LogStore,
    MemoryStore, PollerConfig, PollerError, RetryConfig,
};

const ADDR: &str = "0x00000000000000000000000000000000000000aa";
const OTHER_ADDR: &str = "0x00000000000000000000000000000000000000bb";
const SIG: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
const OTHER_SIG: &str = "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925";

// ─── Helpers ──────────────────────────────────────────────────────────────────

struct Harness {
    chain: Arc<MockChainClient>,
    heads: Arc<MockHeads>,
    store: MemoryChainStore,
    poller: LogPoller,
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        ..Default::default()
    }
}

fn harness(config: PollerConfig) -> Harness {
    let chain = Arc::new(MockChainClient::new(ChainId(1)));
    let heads = Arc::new(MockHeads::default());
    let store = MemoryStore::new().scoped(ChainId(1));
    let poller = LogPoller::new(chain.clone(), heads.clone(), Arc::new(store.clone()), config).unwrap();
    Harness { chain, heads, store, poller }
}

fn default_config() -> PollerConfig {
    PollerConfig {
        start_block: Some(1),
        poll_interval_ms: 10,
        retry: fast_retry(3),
        ..Default::default()
    }
}

fn transfers() -> Filter {
    Filter::new("transfers", [ADDR], [SIG])
}

fn assert_ordered(logs: &[Log]) {
    for pair in logs.windows(2) {
        assert!(
            (pair[0].block_number, pair[0].log_index) < (pair[1].block_number, pair[1].log_index),
            "logs out of order: {:?} then {:?}",
            (pair[0].block_number, pair[0].log_index),
            (pair[1].block_number, pair[1].log_index),
        );
    }
}

async fn assert_matches_chain(h: &Harness, from: i64, to: i64) {
    let stored = h.store.blocks_range(from, to).await.unwrap();
    assert_eq!(stored.len() as i64, to - from + 1, "missing blocks in {from}..={to}");
    for block in stored {
        assert_eq!(Some(&block), h.chain.block(block.number).as_ref(), "block {} differs", block.number);
    }
}

// ─── Scenario 1: matching log in a plain range ────────────────────────────────

#[tokio::test]
async fn returns_exactly_the_matching_log() {
    let h = harness(default_config());
    h.chain.extend(10);
    let wanted = h.chain.add_log(5, ADDR, &[SIG], vec![7]);
    h.chain.add_log(6, OTHER_ADDR, &[SIG], vec![]);
    h.chain.add_log(7, ADDR, &[OTHER_SIG], vec![]);
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();

    h.poller.poll_once().await.unwrap();

    let logs = h.poller.logs_with_sigs(1, 10, &[SIG], ADDR).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_number, 5);
    assert_eq!(logs[0].tx_hash, wanted.tx_hash);
    assert_eq!(logs[0].data, vec![7]);
    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 10);
}

// ─── Scenario 2: reorg replaces the diverged tail ─────────────────────────────

#[tokio::test]
async fn reorg_replaces_diverged_blocks_in_one_tick() {
    let h = harness(default_config());
    h.chain.extend(10);
    for n in 6..=10 {
        h.chain.add_log(n, ADDR, &[SIG], vec![n as u8]);
    }
    h.heads.follow(&h.chain, 6);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();
    let orphaned: HashSet<String> = (8..=10).map(|n| h.chain.block(n).unwrap().hash).collect();

    let head = h.chain.reorg(8, 5);
    assert_eq!(head.number, 12);
    h.chain.add_log(8, ADDR, &[SIG], vec![80]);
    h.chain.add_log(12, ADDR, &[SIG], vec![120]);
    h.heads.follow(&h.chain, 6);

    h.poller.poll_once().await.unwrap();

    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 12);
    assert_matches_chain(&h, 1, 12).await;
    let logs = h.poller.logs_with_sigs(1, 12, &[SIG], ADDR).await.unwrap();
    assert_eq!(logs.iter().map(|l| l.block_number).collect::<Vec<_>>(), vec![6, 7, 8, 12]);
    assert!(logs.iter().all(|l| !orphaned.contains(&l.block_hash)));
    assert_ordered(&logs);
}

#[tokio::test]
async fn same_height_reorg_is_caught_at_the_tip() {
    let h = harness(default_config());
    h.chain.extend(10);
    h.heads.follow(&h.chain, 5);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    h.chain.reorg(9, 2);
    h.chain.add_log(10, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 5);
    h.poller.poll_once().await.unwrap();

    assert_matches_chain(&h, 1, 10).await;
    assert_eq!(h.poller.logs(1, 10, SIG, ADDR).await.unwrap().len(), 1);
}

#[tokio::test]
async fn tracker_reorg_event_schedules_rollback() {
    let h = harness(default_config());
    h.chain.extend(20);

    let tracker = HeadTracker::new(
        h.chain.clone(),
        HeadTrackerConfig {
            poll_interval_ms: 60_000,
            history_depth: 32,
            finality: FinalityMode::FixedDepth { depth: 8 },
            retry: fast_retry(1),
            ..Default::default()
        },
        None,
    )
    .unwrap();
    tracker.start().await.unwrap();
    let poller = LogPoller::new(
        h.chain.clone(),
        Arc::new(tracker.clone()),
        Arc::new(h.store.clone()),
        default_config(),
    )
    .unwrap();
    tracker.add_listener(poller.reorg_listener());
    poller.register_filter(transfers()).await.unwrap();
    poller.poll_once().await.unwrap();
    assert_eq!(poller.poller_state().await.unwrap().unwrap().last_processed_block, 20);

    let mut events = tracker.subscribe();
    h.chain.reorg(16, 6);
    h.chain.add_log(17, ADDR, &[SIG], vec![]);
    tracker.process_head(h.chain.head()).await.unwrap();
    let mut saw_reorg = false;
    while let Ok(event) = events.try_recv() {
        if let chainpoll_core::HeadEvent::Reorg(reorg) = event {
            assert_eq!(reorg.rollback_from(), 16);
            saw_reorg = true;
        }
    }
    assert!(saw_reorg);

    poller.poll_once().await.unwrap();
    assert_eq!(poller.poller_state().await.unwrap().unwrap().last_processed_block, 21);
    assert_matches_chain(&h, 1, 21).await;
    assert_eq!(poller.logs(1, 21, SIG, ADDR).await.unwrap()[0].block_number, 17);
    tracker.close().await;
}

#[tokio::test]
async fn reorg_below_finalized_halts_the_chain() {
    let h = harness(default_config());
    h.chain.extend(20);
    h.heads.follow(&h.chain, 2);
    h.poller.poll_once().await.unwrap();

    h.chain.reorg(10, 11);
    h.heads.follow(&h.chain, 2);
    let err = h.poller.poll_once().await.unwrap_err();
    assert!(err.is_fatal(), "{err}");
    // Nothing was rewritten.
    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 20);
}

#[tokio::test]
async fn reorg_across_a_pruned_gap_halts_the_chain() {
    let h = harness(default_config());
    h.chain.extend(30);
    h.chain.add_log(5, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 28);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    // Blocks 1..=9 go except block 5, which carries a log.
    assert_eq!(h.store.delete_blocks_before(10, 0).await.unwrap(), 8);

    h.chain.reorg(5, 27);
    h.heads.follow(&h.chain, 28);
    let err = h.poller.poll_once().await.unwrap_err();
    assert!(matches!(err, PollerError::ReorgDepthExceeded { at: 9, .. }), "{err}");
    assert!(err.is_fatal());
    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 30);
    assert_eq!(h.poller.logs(1, 30, SIG, ADDR).await.unwrap()[0].block_number, 5);
}

#[tokio::test]
async fn reorg_down_to_the_first_stored_block_rolls_back() {
    let h = harness(PollerConfig { start_block: Some(10), ..default_config() });
    h.chain.extend(30);
    h.heads.follow(&h.chain, 25);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    h.chain.reorg(10, 21);
    h.chain.add_log(12, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 25);
    h.poller.poll_once().await.unwrap();

    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 30);
    assert_matches_chain(&h, 10, 30).await;
    assert_eq!(h.poller.logs(1, 30, SIG, ADDR).await.unwrap()[0].block_number, 12);
}

#[tokio::test]
async fn finalized_tag_bounds_rollback() {
    let h = harness(default_config());
    h.chain.extend(20);
    h.chain.set_finalized(Some(12));

    let tracker = HeadTracker::new(
        h.chain.clone(),
        HeadTrackerConfig {
            poll_interval_ms: 60_000,
            history_depth: 32,
            finality: FinalityMode::FinalizedTag,
            retry: fast_retry(1),
            ..Default::default()
        },
        None,
    )
    .unwrap();
    tracker.start().await.unwrap();
    assert_eq!(tracker.latest_finalized().unwrap().number, 12);
    let poller = LogPoller::new(
        h.chain.clone(),
        Arc::new(tracker.clone()),
        Arc::new(h.store.clone()),
        default_config(),
    )
    .unwrap();
    tracker.add_listener(poller.reorg_listener());
    poller.register_filter(transfers()).await.unwrap();
    poller.poll_once().await.unwrap();
    assert_eq!(poller.poller_state().await.unwrap().unwrap().last_finalized_block, 12);

    // Just above the finalized block: rolled back and re-indexed.
    h.chain.reorg(13, 9);
    h.chain.add_log(14, ADDR, &[SIG], vec![]);
    tracker.process_head(h.chain.head()).await.unwrap();
    poller.poll_once().await.unwrap();
    assert_eq!(poller.poller_state().await.unwrap().unwrap().last_processed_block, 21);
    assert_matches_chain(&h, 1, 21).await;
    assert_eq!(poller.logs(1, 21, SIG, ADDR).await.unwrap()[0].block_number, 14);

    // Replacing the finalized block itself halts both.
    h.chain.reorg(12, 12);
    let err = tracker.process_head(h.chain.head()).await.unwrap_err();
    assert!(matches!(err, PollerError::ReorgDepthExceeded { .. }), "{err}");
    let err = poller.poll_once().await.unwrap_err();
    assert!(matches!(err, PollerError::ReorgDepthExceeded { .. }), "{err}");
    assert!(err.is_fatal());
    assert_eq!(poller.poller_state().await.unwrap().unwrap().last_processed_block, 21);
    assert_eq!(poller.logs(1, 21, SIG, ADDR).await.unwrap()[0].block_number, 14);
    tracker.close().await;
}

// ─── Scenario 3: replay is idempotent ─────────────────────────────────────────

#[tokio::test]
async fn replay_backfills_a_new_filter_once() {
    let h = harness(default_config());
    h.chain.extend(100);
    for n in (3..=100).step_by(7) {
        h.chain.add_log(n, ADDR, &[SIG], vec![n as u8]);
        h.chain.add_log(n, ADDR, &[SIG], vec![n as u8, 1]);
    }
    h.heads.follow(&h.chain, 10);

    // Index the chain before any filter exists.
    h.poller.poll_once().await.unwrap();
    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 100);

    h.poller.register_filter(transfers()).await.unwrap();
    assert!(h.poller.logs(1, 100, SIG, ADDR).await.unwrap().is_empty());

    h.poller.start().await.unwrap();
    h.poller.replay(1).await.unwrap();
    let first = h.poller.logs(1, 100, SIG, ADDR).await.unwrap();
    assert_eq!(first.len(), 28);
    assert_ordered(&first);

    h.poller.replay(1).await.unwrap();
    let second = h.poller.logs(1, 100, SIG, ADDR).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.store.log_count(), 28);

    assert!(matches!(
        h.poller.replay(101).await,
        Err(PollerError::InvalidReplayBlock { requested: 101, latest: 100 })
    ));
    h.poller.close().await;
    assert!(matches!(h.poller.replay(1).await, Err(PollerError::Stopped(_))));
}

// ─── Scenario 4: transient failures never leave a gap ─────────────────────────

#[tokio::test]
async fn failed_ticks_do_not_advance_progress() {
    let h = harness(PollerConfig { retry: RetryConfig::none(), ..default_config() });
    h.chain.extend(5);
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    h.chain.extend(5);
    for n in 6..=10 {
        h.chain.add_log(n, ADDR, &[SIG], vec![]);
    }
    h.heads.follow(&h.chain, 2);
    h.chain.fail_next(3);
    for _ in 0..3 {
        assert!(h.poller.poll_once().await.unwrap_err().is_retryable());
        assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 5);
    }
    h.poller.poll_once().await.unwrap();

    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 10);
    assert_matches_chain(&h, 1, 10).await;
    let logs = h.poller.logs(1, 10, SIG, ADDR).await.unwrap();
    assert_eq!(logs.iter().map(|l| l.block_number).collect::<Vec<_>>(), vec![6, 7, 8, 9, 10]);
}

#[tokio::test]
async fn retries_absorb_failures_within_one_tick() {
    let h = harness(default_config());
    h.chain.extend(10);
    h.chain.add_log(4, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();

    h.chain.fail_next(3);
    h.poller.poll_once().await.unwrap();
    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 10);
    assert_eq!(h.poller.logs(1, 10, SIG, ADDR).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_store_write_is_retried_next_tick() {
    let h = harness(default_config());
    h.chain.extend(6);
    h.chain.add_log(3, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();

    h.store.fail_next_writes(1);
    assert!(matches!(h.poller.poll_once().await, Err(PollerError::Storage(_))));
    assert!(h.poller.poller_state().await.unwrap().is_none());
    assert_eq!(h.store.block_count(), 0);

    h.poller.poll_once().await.unwrap();
    assert_matches_chain(&h, 1, 6).await;
    assert_eq!(h.store.log_count(), 1);
}

#[tokio::test]
async fn oversized_log_queries_are_split() {
    let h = harness(PollerConfig { backfill_batch_size: 64, ..default_config() });
    h.chain.extend(64);
    for n in [1, 17, 33, 64] {
        h.chain.add_log(n, ADDR, &[SIG], vec![]);
    }
    h.chain.set_max_log_range(Some(10));
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();

    h.poller.poll_once().await.unwrap();
    assert_eq!(h.poller.logs(1, 64, SIG, ADDR).await.unwrap().len(), 4);
    assert_matches_chain(&h, 1, 64).await;
}

// ─── Scenario 5: readers never see a torn reorg ───────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_see_old_or_new_chain() {
    let h = harness(default_config());
    h.chain.extend(40);
    for n in 20..=40 {
        h.chain.add_log(n, ADDR, &[SIG], vec![]);
    }
    h.heads.follow(&h.chain, 16);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    let old: Vec<String> = h.poller.logs(1, 40, SIG, ADDR).await.unwrap().into_iter().map(|l| l.block_hash).collect();
    assert_eq!(old.len(), 21);

    h.chain.reorg(30, 11);
    for n in 30..=40 {
        h.chain.add_log(n, ADDR, &[SIG], vec![]);
    }
    let new: Vec<String> = (20..=40).map(|n| h.chain.block(n).unwrap().hash).collect();
    h.heads.follow(&h.chain, 16);

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let poller = h.poller.clone();
            let (old, new) = (old.clone(), new.clone());
            tokio::spawn(async move {
                let mut saw_new = false;
                for _ in 0..200 {
                    let hashes: Vec<String> =
                        poller.logs(1, 40, SIG, ADDR).await.unwrap().into_iter().map(|l| l.block_hash).collect();
                    assert!(hashes == old || hashes == new, "torn read: {hashes:?}");
                    saw_new |= hashes == new;
                    tokio::task::yield_now().await;
                }
                saw_new
            })
        })
        .collect();

    h.poller.poll_once().await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    let after: Vec<String> = h.poller.logs(1, 40, SIG, ADDR).await.unwrap().into_iter().map(|l| l.block_hash).collect();
    assert_eq!(after, new);
}

// ─── Properties ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn confirmation_bound_is_respected() {
    let h = harness(default_config());
    h.chain.extend(20);
    for n in [5, 10, 15, 19, 20] {
        h.chain.add_log(n, ADDR, &[SIG], vec![]);
    }
    h.heads.follow(&h.chain, 8);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    for (confs, expected) in [(0, 20), (1, 19), (2, 15), (5, 15), (6, 10), (15, 5)] {
        let log = h
            .poller
            .latest_log_by_event_sig_with_confs(SIG, ADDR, Confirmations::Depth(confs))
            .await
            .unwrap();
        assert_eq!(log.block_number, expected, "confirmations {confs}");
        assert!(log.block_number <= 20 - confs as i64);
    }
    let finalized = h
        .poller
        .latest_log_by_event_sig_with_confs(SIG, ADDR, Confirmations::Finalized)
        .await
        .unwrap();
    assert_eq!(finalized.block_number, 10);
    let none = h
        .poller
        .latest_log_by_event_sig_with_confs(SIG, ADDR, Confirmations::Depth(16))
        .await
        .unwrap_err();
    assert!(none.is_not_found());
}

#[tokio::test]
async fn indexed_queries_filter_on_topics() {
    let h = harness(default_config());
    h.chain.extend(10);
    let alice = "0x000000000000000000000000000000000000000000000000000000000000a11c";
    let bob = "0x0000000000000000000000000000000000000000000000000000000000000b0b";
    h.chain.add_log(2, ADDR, &[SIG, alice, bob], vec![]);
    h.chain.add_log(3, ADDR, &[SIG, bob, alice], vec![]);
    h.chain.add_log(3, ADDR, &[SIG, alice, alice], vec![]);
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    let from_alice = h
        .poller
        .indexed_logs(SIG, ADDR, 1, &[alice], Confirmations::Depth(0))
        .await
        .unwrap();
    assert_eq!(from_alice.iter().map(|l| (l.block_number, l.log_index)).collect::<Vec<_>>(), vec![(2, 0), (3, 1)]);

    let to_alice = h
        .poller
        .indexed_logs_by_block_range(3, 3, SIG, ADDR, 2, &[alice])
        .await
        .unwrap();
    assert_eq!(to_alice.len(), 2);
    assert_ordered(&to_alice);

    let by_tx = h
        .poller
        .indexed_logs_by_tx_hash(SIG, ADDR, &from_alice[0].tx_hash)
        .await
        .unwrap();
    assert_eq!(by_tx.len(), 1);

    assert!(matches!(
        h.poller.indexed_logs(SIG, ADDR, 4, &[alice], Confirmations::Depth(0)).await,
        Err(PollerError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn unregistered_filter_stops_new_logs() {
    let h = harness(default_config());
    h.chain.extend(5);
    h.chain.add_log(2, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.poll_once().await.unwrap();

    h.poller.unregister_filter("transfers").await.unwrap();
    assert!(h.poller.unregister_filter("transfers").await.unwrap_err().is_not_found());
    h.chain.extend(3);
    h.chain.add_log(7, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 2);
    h.poller.poll_once().await.unwrap();

    // Existing rows stay; nothing new is fetched.
    let logs = h.poller.logs(1, 8, SIG, ADDR).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(h.poller.poller_state().await.unwrap().unwrap().last_processed_block, 8);
}

#[tokio::test]
async fn running_loop_follows_the_head() {
    let h = harness(default_config());
    h.chain.extend(4);
    h.heads.follow(&h.chain, 2);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.start().await.unwrap();
    assert!(matches!(h.poller.poll_once().await, Err(PollerError::AlreadyStarted(_))));

    h.chain.extend(4);
    h.chain.add_log(8, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 2);

    let poller = h.poller.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while poller.logs(1, 8, SIG, ADDR).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.poller.close().await;
    h.poller.close().await;
}

// ─── Maintenance ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn pruning_drops_empty_old_blocks_and_expired_logs() {
    let h = harness(PollerConfig { keep_finalized_blocks_depth: 5, ..default_config() });
    h.chain.extend(30);
    h.chain.add_log(3, OTHER_ADDR, &[SIG], vec![]);
    h.chain.add_log(5, ADDR, &[SIG], vec![]);
    h.heads.follow(&h.chain, 10);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller
        .register_filter(Filter::new("expiring", [OTHER_ADDR], [SIG]).with_retention(Duration::from_secs(86_400)))
        .await
        .unwrap();

    h.poller.poll_once().await.unwrap();
    assert_eq!(h.store.block_count(), 30);
    assert_eq!(h.store.log_count(), 2);

    // Finalized 20, keep 5: blocks below 15 go unless they carry logs.
    h.poller.prune_once().await.unwrap();
    assert_eq!(h.store.block_count(), 18);
    assert_eq!(h.store.log_count(), 1);
    assert_eq!(h.poller.logs(1, 30, SIG, ADDR).await.unwrap().len(), 1);
    assert!(h.poller.logs(1, 30, SIG, OTHER_ADDR).await.unwrap().is_empty());

    // Block 3 lost its only log and is pruned on the next pass.
    h.poller.prune_once().await.unwrap();
    assert_eq!(h.store.block_count(), 17);
    assert_eq!(h.poller.block_by_number(5).await.unwrap().number, 5);
}

#[tokio::test]
async fn backup_poller_recovers_logs_missed_the_first_time() {
    let h = harness(PollerConfig { backup_poller_block_delay: 20, ..default_config() });
    h.chain.extend(30);
    h.heads.follow(&h.chain, 10);
    h.poller.register_filter(transfers()).await.unwrap();
    h.poller.start().await.unwrap();

    let poller = h.poller.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while !matches!(poller.poller_state().await, Ok(Some(s)) if s.last_processed_block >= 30) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // The node "forgot" this log when block 25 was first indexed.
    h.chain.add_log(25, ADDR, &[SIG], vec![9]);
    h.chain.extend(10);
    h.heads.follow(&h.chain, 10);

    let poller = h.poller.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while poller.logs(1, 40, SIG, ADDR).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let logs = h.poller.logs(1, 40, SIG, ADDR).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_number, 25);
    assert_eq!(logs[0].data, vec![9]);
    h.poller.close().await;
}

#[tokio::test]
async fn backup_poller_waits_for_a_filter_before_moving_on() {
    let h = harness(PollerConfig { backup_poller_block_delay: 20, ..default_config() });
    h.chain.extend(30);
    h.heads.follow(&h.chain, 10);
    h.poller.start().await.unwrap();

    let poller = h.poller.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while !matches!(poller.poller_state().await, Ok(Some(s)) if s.last_processed_block >= 30) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Let the backup poller tick a few times with nothing registered.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Block 15 was indexed before any filter existed; the head does not move.
    h.chain.add_log(15, ADDR, &[SIG], vec![4]);
    h.poller.register_filter(transfers()).await.unwrap();

    let poller = h.poller.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while poller.logs(1, 30, SIG, ADDR).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let logs = h.poller.logs(1, 30, SIG, ADDR).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_number, 15);
    h.poller.close().await;
}

#[tokio::test]
async fn log_cap_keeps_the_newest_finalized_logs() {
    let h = harness(default_config());
    h.chain.extend(30);
    h.chain.add_log(3, OTHER_ADDR, &[SIG], vec![]);
    for n in [4, 5, 6, 25] {
        h.chain.add_log(n, ADDR, &[SIG], vec![n as u8]);
    }
    h.heads.follow(&h.chain, 10);
    h.poller
        .register_filter(Filter::new("capped", [ADDR, OTHER_ADDR], [SIG]).with_max_logs_kept(2))
        .await
        .unwrap();
    h.poller.register_filter(Filter::new("keeper", [OTHER_ADDR], [SIG])).await.unwrap();
    h.poller.poll_once().await.unwrap();
    assert_eq!(h.store.log_count(), 5);

    // Finalized 20: blocks 6 and 5 fill the cap, 4 goes, 3 is still wanted
    // by the uncapped filter, 25 is not finalized yet.
    h.poller.prune_once().await.unwrap();
    assert_eq!(h.store.log_count(), 4);
    let kept = h.poller.logs(1, 30, SIG, ADDR).await.unwrap();
    assert_eq!(kept.iter().map(|l| l.block_number).collect::<Vec<_>>(), vec![5, 6, 25]);
    assert_eq!(h.poller.logs(1, 30, SIG, OTHER_ADDR).await.unwrap().len(), 1);

    h.poller.prune_once().await.unwrap();
    assert_eq!(h.store.log_count(), 4);
}
