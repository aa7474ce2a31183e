use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{
        assert_is_contiguous, fast_config, init_tracing, test_client, wait_for_blocks,
        wait_until_settled,
    },
    mock_rpc::{MockChain, MockRpcServer, CREATED_CONTRACT},
};
use anyhow::{Context, Result};
use chainindex::{MemoryStore, Runner};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_contract_code_aborts_runner() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6, 2);
    chain.set_conflicting_creates(4);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url())
        .follow_head(false)
        .internal_transactions_batch_size(100)
        .build()?;
    let mut runner = Runner::new(config, test_client(server.url())?, store.clone());
    let outcome = timeout(Duration::from_secs(10), runner.run_until_ctrl_c())
        .await
        .context("runner should stop after the fatal error")?;

    let err = outcome.expect_err("conflicting contract code should abort the runner");
    let message = format!("{err:#}");
    assert!(
        message.contains("block processing pipeline aborted"),
        "runner did not propagate the fatal error, got {message}"
    );
    assert!(
        message.contains("fatal error during internal transactions"),
        "unexpected fatal stage, got {message}"
    );

    let traced = store
        .internal_transactions_of(MockChain::transaction_hash(4, 0))
        .await;
    assert!(traced.is_empty(), "conflicting traces must not be imported");
    assert!(store
        .address(CREATED_CONTRACT)
        .await
        .and_then(|address| address.contract_code)
        .is_none());

    drop(runner);
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_can_restart_after_stop() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(8, 1);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url()).build()?;
    let mut runner = Runner::new(config, test_client(server.url())?, store.clone());

    runner.start().await?;
    wait_until_settled(runner.fetcher(), Duration::from_secs(10)).await?;
    runner.stop().await?;
    assert!(!runner.fetcher().is_running());

    chain.set_head(14);
    runner.start().await?;
    wait_until_settled(runner.fetcher(), Duration::from_secs(10)).await?;
    runner.stop().await?;
    drop(runner);
    server.shutdown().await;

    let numbers = store.block_numbers().await;
    assert_eq!(numbers.first(), Some(&0));
    assert_eq!(numbers.last(), Some(&14));
    assert_is_contiguous(&numbers);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_from_config_authenticates() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(4, 1);
    let server = MockRpcServer::start_with_auth(chain, "indexer", "secret").await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url())
        .rpc_auth("indexer", "secret")
        .follow_head(false)
        .build()?;
    let mut runner = Runner::from_config(config, store.clone())?;

    runner.start().await?;
    wait_until_settled(runner.fetcher(), Duration::from_secs(10)).await?;
    let counts = runner.fetcher().persisted_counts().await?;
    runner.stop().await?;
    drop(runner);
    server.shutdown().await;

    assert_eq!(counts.blocks, 5);
    assert_eq!(store.block_numbers().await, (0..=4).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_until_stops_on_interrupt() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6, 1);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url()).build()?;
    let mut runner = Runner::new(config, test_client(server.url())?, store.clone());
    let watched = store.clone();
    let interrupt = async move {
        let _ = wait_for_blocks(&watched, 7, Duration::from_secs(10)).await;
    };

    timeout(Duration::from_secs(15), runner.run_until(interrupt))
        .await
        .context("runner should stop once interrupted")??;
    assert!(!runner.fetcher().is_running());
    assert!(!runner.cancellation_token().is_cancelled());
    drop(runner);
    server.shutdown().await;

    assert_eq!(store.block_numbers().await, (0..=6).collect::<Vec<_>>());
    Ok(())
}
