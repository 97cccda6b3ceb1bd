//! `chainpoll run`: index every configured chain until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use chainpoll_core::{ChainEngine, ChainId, HeadStore, LogStore};
use chainpoll_evm::EvmChainClient;
use chainpoll_storage::{MemoryStore, SqliteStorage};

use crate::config::{ChainConfig, ServiceConfig, StorageConfig};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// The backing store shared by every chain.
enum Storage {
    Memory(MemoryStore),
    Sqlite(SqliteStorage),
}

impl Storage {
    async fn open(config: &StorageConfig) -> Result<Self> {
        match &config.path {
            Some(path) => {
                let storage = SqliteStorage::open(path)
                    .await
                    .with_context(|| format!("failed to open database {path}"))?;
                tracing::info!(path = %path, "using SQLite storage");
                Ok(Self::Sqlite(storage))
            }
            None => {
                tracing::warn!("no [storage] path configured, indexed data is kept in memory only");
                Ok(Self::Memory(MemoryStore::new()))
            }
        }
    }

    fn scoped(&self, chain_id: ChainId) -> (Arc<dyn LogStore>, Arc<dyn HeadStore>) {
        match self {
            Self::Memory(store) => {
                let scoped = store.scoped(chain_id);
                (Arc::new(scoped.clone()), Arc::new(scoped))
            }
            Self::Sqlite(storage) => {
                let scoped = storage.scoped(chain_id);
                (Arc::new(scoped.clone()), Arc::new(scoped))
            }
        }
    }

    async fn close(&self) {
        if let Self::Sqlite(storage) = self {
            storage.close().await;
        }
    }
}

pub async fn run(config: ServiceConfig) -> Result<()> {
    let storage = Storage::open(&config.storage).await?;

    let mut engines = Vec::with_capacity(config.chains.len());
    for chain in &config.chains {
        match start_engine(chain, &storage).await {
            Ok(engine) => {
                tracing::info!(
                    chain_id = chain.chain_id,
                    url = %chain.rpc_url,
                    filters = chain.filters.len(),
                    "chain engine started"
                );
                spawn_reorg_logger(&engine);
                engines.push(engine);
            }
            Err(e) => {
                shutdown(&engines, &storage).await;
                return Err(e.context(format!("chain {} failed to start", chain.chain_id)));
            }
        }
    }

    let mut halted = vec![false; engines.len()];
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                tracing::info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                for (engine, halted) in engines.iter().zip(halted.iter_mut()) {
                    if *halted {
                        continue;
                    }
                    if let Some(err) = engine.health() {
                        *halted = true;
                        tracing::error!(
                            chain_id = %engine.chain_id(),
                            error = %err,
                            "chain engine halted, operator intervention required"
                        );
                    }
                }
            }
        }
    }

    shutdown(&engines, &storage).await;
    Ok(())
}

async fn start_engine(chain: &ChainConfig, storage: &Storage) -> Result<ChainEngine> {
    let engine = build_engine(chain, storage).await?;
    engine.start().await?;
    Ok(engine)
}

async fn build_engine(chain: &ChainConfig, storage: &Storage) -> Result<ChainEngine> {
    let chain_id = ChainId(chain.chain_id);
    let client = EvmChainClient::http(chain_id, &chain.rpc_url, chain.request_timeout())?;
    if chain.verify_chain_id {
        client.verify_chain_id().await?;
    }

    let (store, head_store) = storage.scoped(chain_id);
    let mut builder = ChainEngine::builder(Arc::new(client))
        .store(store)
        .head_store(head_store)
        .head_tracker_config(chain.head_tracker.clone())
        .poller_config(chain.poller.clone());
    for filter in &chain.filters {
        builder = builder.filter(filter.to_filter()?);
    }
    Ok(builder.build()?)
}

fn spawn_reorg_logger(engine: &ChainEngine) {
    let mut events = engine.tracker().subscribe();
    let chain_id = engine.chain_id();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(chainpoll_core::HeadEvent::Reorg(event)) => {
                    tracing::warn!(
                        chain_id = %chain_id,
                        depth = event.depth(),
                        common_ancestor = event.common_ancestor.number,
                        new_head = event.new_head.number,
                        "chain reorganization"
                    );
                }
                Ok(chainpoll_core::HeadEvent::NewHead(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(chain_id = %chain_id, skipped, "head event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown(engines: &[ChainEngine], storage: &Storage) {
    for engine in engines {
        engine.close().await;
    }
    storage.close().await;
}
