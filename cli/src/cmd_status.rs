//! `chainpoll status`: print per-chain progress from the database.

use anyhow::{Context, Result};

use chainpoll_core::{ChainId, LogStore};
use chainpoll_storage::SqliteStorage;

pub async fn run(db: &str, chain: Option<u64>, as_json: bool) -> Result<()> {
    let storage = SqliteStorage::open(db)
        .await
        .with_context(|| format!("failed to open database {db}"))?;

    let mut rows = Vec::new();
    for (chain_id, state) in storage.chain_states().await? {
        if chain.is_some_and(|c| ChainId(c) != chain_id) {
            continue;
        }
        let store = storage.scoped(chain_id);
        let latest = store.latest_block().await?;
        let filters = store.load_filters().await?;
        rows.push((chain_id, state, latest, filters));
    }
    storage.close().await;

    if as_json {
        let out: Vec<_> = rows
            .iter()
            .map(|(chain_id, state, latest, filters)| {
                serde_json::json!({
                    "chain_id": chain_id,
                    "last_processed_block": state.last_processed_block,
                    "last_finalized_block": state.last_finalized_block,
                    "latest_block": latest,
                    "filters": filters.iter().map(|f| &f.name).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No chains indexed in {db}");
        return Ok(());
    }
    for (chain_id, state, latest, filters) in rows {
        println!("Chain {chain_id}");
        println!("  Last processed block: {}", state.last_processed_block);
        println!("  Last finalized block: {}", state.last_finalized_block);
        match latest {
            Some(block) => println!("  Latest stored block:  {} ({})", block.number, block.hash),
            None => println!("  Latest stored block:  -"),
        }
        println!("  Filters ({}):", filters.len());
        for filter in filters {
            println!(
                "    {:<24} {} address(es), {} event(s)",
                filter.name,
                filter.addresses.len(),
                filter.event_sigs.len()
            );
        }
    }
    Ok(())
}
