//! The poll loop: the single writer for one chain's store.
//!
//! # Tick
//! 1. Read the head from the head tracker (no RPC).
//! 2. Start at `last_processed_block + 1`, or lower if a reorg listener
//!    asked for a rollback.
//! 3. Process `[from, head]` in batches of `backfill_batch_size`. Each batch
//!    fetches headers and logs, checks that its first header links to the
//!    stored parent, and commits in one store transaction.
//! 4. A broken link walks back to the common ancestor and re-processes from
//!    there. Stored blocks that differ from the fetched ones are replaced in
//!    the same transaction that inserts the new branch.
//!
//! Replays, pruning and the backup poller run on the same task, so the store
//! never sees two writers.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};

use crate::client::LogQuery;
use crate::error::PollerError;
use crate::filter::FilterSet;
use crate::poller::{PollerInner, ReplayRequest};
use crate::types::{Block, Log, PollerState};

enum Step {
    Shutdown,
    Replay(ReplayRequest),
    Poll,
    Prune,
    Backup,
}

impl PollerInner {
    pub(crate) async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut replays: mpsc::Receiver<ReplayRequest>,
    ) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = tokio::time::interval(self.config.prune_interval());
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        prune.reset();
        let mut backup = self.config.backup_interval().map(|period| {
            let mut i = tokio::time::interval(period);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i.reset();
            i
        });
        let mut backup_next: Option<i64> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.changed() => Step::Shutdown,
                Some(req) = replays.recv() => Step::Replay(req),
                _ = poll.tick() => Step::Poll,
                _ = prune.tick() => Step::Prune,
                _ = tick_optional(&mut backup) => Step::Backup,
            };

            let result = match step {
                Step::Shutdown => break,
                Step::Poll => self.poll_tick(&shutdown).await,
                Step::Replay(req) => {
                    let result = self.replay_from(req.from, &shutdown).await;
                    let fatal = result.as_ref().err().filter(|e| e.is_fatal()).cloned();
                    match req.done {
                        Some(done) => {
                            let _ = done.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                tracing::warn!(chain_id = %self.chain_id, from = req.from, error = %e, "replay failed");
                            }
                        }
                    }
                    fatal.map_or(Ok(()), Err)
                }
                Step::Prune => self.prune().await,
                Step::Backup => self.backup_tick(&mut backup_next).await,
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    tracing::error!(chain_id = %self.chain_id, error = %e, "log poller halted, operator action required");
                    self.set_fatal(e);
                    break;
                }
                tracing::warn!(chain_id = %self.chain_id, error = %e, "poll loop step failed, retrying next tick");
            }
        }

        replays.close();
        while let Ok(req) = replays.try_recv() {
            if let Some(done) = req.done {
                let _ = done.send(Err(PollerError::ReplayAborted("log poller is shutting down".into())));
            }
        }
        tracing::debug!(chain_id = %self.chain_id, "poll loop exited");
    }

    // ─── Poll ─────────────────────────────────────────────────────────────────

    pub(crate) async fn poll_tick(&self, shutdown: &watch::Receiver<bool>) -> Result<(), PollerError> {
        let Some(head) = self.heads.latest_head() else {
            tracing::debug!(chain_id = %self.chain_id, "no head yet, skipping tick");
            return Ok(());
        };
        let finalized = self.heads.latest_finalized().map_or(0, |b| b.number);
        let filters = self.filters.snapshot();
        let rollback = self.take_pending_rollback();

        let result = self.poll_to(&head, finalized, &filters, rollback, shutdown).await;
        if result.is_err() {
            if let Some(from) = rollback {
                self.request_rollback(from);
            }
        }
        result
    }

    async fn poll_to(
        &self,
        head: &Block,
        finalized: i64,
        filters: &FilterSet,
        rollback: Option<i64>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), PollerError> {
        let state = self.store.poller_state().await?;
        let mut from = match state {
            Some(s) => s.last_processed_block + 1,
            None => self.config.start_block.unwrap_or(finalized).max(0),
        };
        if let Some(rollback) = rollback {
            from = from.min(rollback.max(0));
        }

        if from > head.number {
            // Nothing new. A reorg at the same height still has to be caught.
            let Some(state) = state else {
                return Ok(());
            };
            match self.check_tip(state.last_processed_block.min(head.number)).await? {
                Some(ancestor) => from = ancestor + 1,
                None => return Ok(()),
            }
        }

        self.process_range(from, head.number, finalized, filters, shutdown).await
    }

    /// Returns the common ancestor if the stored block at `number` is no
    /// longer canonical.
    async fn check_tip(&self, number: i64) -> Result<Option<i64>, PollerError> {
        let Some(stored) = self.store.block_by_number(number).await? else {
            return Ok(None);
        };
        let remote = self.fetch_block(number).await?;
        if remote.hash == stored.hash {
            return Ok(None);
        }
        let ancestor = self.find_common_ancestor(number).await?;
        tracing::warn!(chain_id = %self.chain_id, at = number, ancestor, "stored tip is no longer canonical");
        Ok(Some(ancestor))
    }

    /// Process `[from, to]` in bounded batches. Stops early on shutdown.
    async fn process_range(
        &self,
        mut from: i64,
        to: i64,
        finalized: i64,
        filters: &FilterSet,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), PollerError> {
        let max_batch = self.config.backfill_batch_size as i64;
        let mut batch = max_batch;
        while from <= to {
            if *shutdown.borrow() {
                tracing::debug!(chain_id = %self.chain_id, at = from, "shutdown requested, stopping between batches");
                return Ok(());
            }
            let end = (from + batch - 1).min(to);
            match self.process_batch(from, end, finalized, filters).await {
                Ok(next) => from = next,
                Err(PollerError::LimitExceeded(msg)) if end > from => {
                    batch = ((end - from + 1) / 2).max(1);
                    tracing::warn!(
                        chain_id = %self.chain_id,
                        from,
                        to = end,
                        batch,
                        error = %msg,
                        "log query too large, halving batch"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fetch and commit one batch. Returns the next block to process.
    async fn process_batch(
        &self,
        from: i64,
        end: i64,
        finalized: i64,
        filters: &FilterSet,
    ) -> Result<i64, PollerError> {
        let blocks = self.fetch_blocks(from, end).await?;
        if let Some(pair) = blocks.windows(2).find(|w| !w[1].extends(&w[0])) {
            return Err(PollerError::TransientRpc(format!(
                "headers {} and {} do not link",
                pair[0].number, pair[1].number
            )));
        }

        if from > 0 {
            if let Some(parent) = self.store.block_by_number(from - 1).await? {
                if parent.hash != blocks[0].parent_hash {
                    let ancestor = self.find_common_ancestor(from - 1).await?;
                    tracing::warn!(
                        chain_id = %self.chain_id,
                        at = from - 1,
                        ancestor,
                        "reorg detected, re-processing from common ancestor"
                    );
                    return Ok(ancestor + 1);
                }
            }
        }

        let logs = self.fetch_logs(from, end, &blocks, filters).await?;

        let stored = self.store.blocks_range(from, end).await?;
        let diverged = stored
            .iter()
            .find(|s| blocks.get((s.number - from) as usize).map_or(true, |b| b.hash != s.hash))
            .map(|s| s.number);

        let prev = self.store.poller_state().await?;
        let prev_finalized = prev.map_or(0, |s| s.last_finalized_block);
        let last_finalized_block = prev_finalized.max(finalized);

        match diverged {
            Some(at) => {
                if prev.is_some() && at <= prev_finalized {
                    return Err(PollerError::ReorgDepthExceeded { at, floor: prev_finalized });
                }
                let state = PollerState { last_processed_block: end, last_finalized_block };
                self.store.replace_from_block(at, &blocks, &logs, state).await?;
                tracing::info!(
                    chain_id = %self.chain_id,
                    from = at,
                    to = end,
                    logs = logs.len(),
                    "replaced reorged blocks"
                );
            }
            None => {
                let last_processed_block = prev.map_or(end, |s| s.last_processed_block.max(end));
                let state = PollerState { last_processed_block, last_finalized_block };
                self.store.insert_blocks_and_logs(&blocks, &logs, state).await?;
                tracing::debug!(chain_id = %self.chain_id, from, to = end, logs = logs.len(), "batch committed");
            }
        }
        Ok(end + 1)
    }

    /// Walk back from `start` until the stored block matches the chain.
    ///
    /// A missing block ends the walk only when nothing is stored below it.
    /// A gap left by pruning cannot be verified and is treated as a reorg
    /// past finality.
    async fn find_common_ancestor(&self, start: i64) -> Result<i64, PollerError> {
        let finalized = self.store.poller_state().await?.map_or(-1, |s| s.last_finalized_block);
        let floor = start - self.config.max_reorg_depth as i64;
        let mut number = start;
        loop {
            if number < 0 {
                return Ok(-1);
            }
            let Some(stored) = self.store.block_by_number(number).await? else {
                let oldest = self.store.oldest_block().await?;
                if oldest.map_or(true, |b| b.number > number) {
                    return Ok(number);
                }
                return Err(PollerError::ReorgDepthExceeded { at: number, floor: finalized.max(floor) });
            };
            let remote = self.fetch_block(number).await?;
            if remote.hash == stored.hash {
                return Ok(number);
            }
            if number <= finalized {
                return Err(PollerError::ReorgDepthExceeded { at: number, floor: finalized });
            }
            if number <= floor {
                return Err(PollerError::ReorgDepthExceeded { at: number, floor });
            }
            number -= 1;
        }
    }

    // ─── Fetch ────────────────────────────────────────────────────────────────

    async fn fetch_block(&self, number: i64) -> Result<Block, PollerError> {
        let client = &self.client;
        self.retry
            .run("block_by_number", self.config.rpc_timeout(), || client.block_by_number(number))
            .await
    }

    /// Headers for `[from, to]`, in `rpc_batch_size` chunks fetched
    /// concurrently.
    async fn fetch_blocks(&self, from: i64, to: i64) -> Result<Vec<Block>, PollerError> {
        let numbers: Vec<i64> = (from..=to).collect();
        let client = &self.client;
        let timeout = self.config.rpc_timeout();
        let chunks = numbers.chunks(self.config.rpc_batch_size as usize).map(|chunk| {
            self.retry
                .run("blocks_by_numbers", timeout, move || client.blocks_by_numbers(chunk))
        });
        let blocks: Vec<Block> = futures::future::try_join_all(chunks).await?.into_iter().flatten().collect();

        let complete = blocks.len() == numbers.len()
            && blocks.iter().zip(&numbers).all(|(b, n)| b.number == *n);
        if !complete {
            return Err(PollerError::TransientRpc(format!(
                "incomplete header batch for blocks {from}..={to}"
            )));
        }
        Ok(blocks)
    }

    /// Logs in `[from, to]` that match a registered filter, ordered by
    /// `(block_number, log_index)`. `blocks` are the headers of the range.
    async fn fetch_logs(
        &self,
        from: i64,
        to: i64,
        blocks: &[Block],
        filters: &FilterSet,
    ) -> Result<Vec<Log>, PollerError> {
        if filters.is_empty() {
            return Ok(vec![]);
        }
        let query = LogQuery {
            from_block: from,
            to_block: to,
            addresses: filters.addresses(),
            topics: vec![filters.event_sigs()],
        };
        let client = &self.client;
        let raw = self
            .retry
            .run("filter_logs", self.config.rpc_timeout(), || client.filter_logs(&query))
            .await?;

        let created_at = Utc::now();
        let mut logs = Vec::with_capacity(raw.len());
        for raw in raw {
            let raw = raw.normalized();
            if raw.removed {
                continue;
            }
            let block = usize::try_from(raw.block_number - from)
                .ok()
                .and_then(|i| blocks.get(i))
                .ok_or_else(|| {
                    PollerError::TransientRpc(format!("log at block {} outside requested range", raw.block_number))
                })?;
            if block.hash != raw.block_hash {
                return Err(PollerError::TransientRpc(format!(
                    "log at block {} references hash {} but the header has {}",
                    raw.block_number, raw.block_hash, block.hash
                )));
            }
            let Some(event_sig) = raw.event_sig().map(str::to_string) else {
                continue;
            };
            let log = Log {
                block_number: raw.block_number,
                block_hash: raw.block_hash,
                tx_hash: raw.tx_hash,
                log_index: raw.log_index,
                address: raw.address,
                event_sig,
                topics: raw.topics,
                data: raw.data,
                block_timestamp: block.timestamp,
                created_at,
            };
            if filters.matches(&log) {
                logs.push(log);
            }
        }
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    // ─── Replay ───────────────────────────────────────────────────────────────

    async fn replay_from(&self, from: i64, shutdown: &watch::Receiver<bool>) -> Result<(), PollerError> {
        let Some(head) = self.heads.latest_head() else {
            return Err(PollerError::ReplayAborted("no head available".into()));
        };
        let finalized = self.heads.latest_finalized().map_or(0, |b| b.number);
        let last_processed = self.store.poller_state().await?.map(|s| s.last_processed_block);
        let start = last_processed.map_or(from, |lp| from.min(lp + 1));

        tracing::info!(chain_id = %self.chain_id, from = start, to = head.number, "replaying logs");
        let filters = self.filters.snapshot();
        self.process_range(start, head.number, finalized, &filters, shutdown).await?;
        if *shutdown.borrow() {
            return Err(PollerError::ReplayAborted("log poller is shutting down".into()));
        }
        tracing::info!(chain_id = %self.chain_id, from = start, to = head.number, "replay complete");
        Ok(())
    }

    // ─── Maintenance ──────────────────────────────────────────────────────────

    pub(crate) async fn prune(&self) -> Result<(), PollerError> {
        let page = self.config.log_prune_page_size;
        let keep = self.config.keep_finalized_blocks_depth as i64;
        if keep > 0 {
            if let Some(state) = self.store.poller_state().await? {
                let end = state.last_finalized_block.min(state.last_processed_block) - keep;
                if end > 0 {
                    let deleted = self.store.delete_blocks_before(end, page).await?;
                    if deleted > 0 {
                        tracing::debug!(chain_id = %self.chain_id, deleted, below = end, "pruned old blocks");
                    }
                }
            }
        }

        let filters = self.filters.snapshot();
        let rules = filters.retention_rules();
        if !rules.is_empty() {
            let deleted = self.store.delete_expired_logs(&rules, Utc::now(), page).await?;
            if deleted > 0 {
                tracing::debug!(chain_id = %self.chain_id, deleted, "pruned expired logs");
            }
        }

        // Only finalized logs count against a filter's cap.
        if filters.has_log_caps() {
            if let Some(state) = self.store.poller_state().await? {
                let up_to = state.last_finalized_block.min(state.last_processed_block);
                let deleted = self.store.delete_excess_logs(filters.as_slice(), up_to, page).await?;
                if deleted > 0 {
                    tracing::debug!(chain_id = %self.chain_id, deleted, up_to, "pruned logs over filter caps");
                }
            }
        }
        Ok(())
    }

    /// Re-fetch logs of finalized blocks not yet re-checked and upsert them.
    async fn backup_tick(&self, next: &mut Option<i64>) -> Result<(), PollerError> {
        let Some(state) = self.store.poller_state().await? else {
            return Ok(());
        };
        let end = state.last_finalized_block.min(state.last_processed_block);
        let start = next.unwrap_or_else(|| (end - self.config.backup_poller_block_delay as i64 + 1).max(0));
        if start > end {
            return Ok(());
        }
        // The cursor stays put so a filter registered later still gets
        // these blocks re-checked.
        let filters = self.filters.snapshot();
        if filters.is_empty() {
            return Ok(());
        }

        let batch = self.config.backfill_batch_size as i64;
        let mut from = start;
        while from <= end {
            let to = (from + batch - 1).min(end);
            let blocks = self.fetch_blocks(from, to).await?;
            let stored = self.store.blocks_range(from, to).await?;
            if let Some(s) = stored.iter().find(|s| blocks[(s.number - from) as usize].hash != s.hash) {
                tracing::warn!(
                    chain_id = %self.chain_id,
                    at = s.number,
                    "backup poller found a finalized block that changed, skipping"
                );
                return Ok(());
            }
            let logs = self.fetch_logs(from, to, &blocks, &filters).await?;
            let carrying: Vec<Block> = blocks
                .into_iter()
                .filter(|b| logs.iter().any(|l| l.block_number == b.number))
                .collect();
            let state = self.store.poller_state().await?.unwrap_or(state);
            self.store.insert_blocks_and_logs(&carrying, &logs, state).await?;
            tracing::debug!(chain_id = %self.chain_id, from, to, logs = logs.len(), "backup poll committed");
            from = to + 1;
            *next = Some(from);
        }
        Ok(())
    }
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => futures::future::pending().await,
    }
}
