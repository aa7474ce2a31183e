use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{
        assert_is_contiguous, fast_config, init_tracing, test_client, wait_for_blocks,
        wait_for_pending, wait_until_settled, FlakyStore,
    },
    mock_rpc::{MockChain, MockRpcServer, LOG_EMITTER, MINER, SENDER},
};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use chainindex::rpc::{contract::encode_argument, encode_call, AbiValue};
use chainindex::{AsyncRpcClient, BasicAuth, BlockFetcher, ChainStore, MemoryStore, RpcClientOptions};
use tokio::time::timeout;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catchup_indexes_blocks_traces_and_balances() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(20, 2);
    let server = MockRpcServer::start(chain.clone()).await?;
    let rpc = test_client(server.url())?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url()).follow_head(false).build()?;
    let mut fetcher = BlockFetcher::new(config, rpc.clone(), store.clone());
    fetcher.start().await?;
    wait_until_settled(&fetcher, SETTLE_TIMEOUT).await?;

    assert_eq!(store.block_numbers().await, (0..=20).collect::<Vec<_>>());
    let counts = fetcher.persisted_counts().await?;
    assert_eq!(counts.blocks, 21);
    assert_eq!(counts.transactions, 42);
    assert_eq!(counts.logs, 42);
    assert_eq!(counts.internal_transactions, 42);
    // miner, sender, log emitter, and one recipient per transaction
    assert_eq!(counts.addresses, 45);

    let block = store.block(3).await.expect("block 3 indexed");
    assert_eq!(block.miner_hash, Some(MINER));
    assert_eq!(block.parent_hash, Some(MockChain::block_hash(2)));
    let logs = store.logs().await;
    assert_eq!(logs.len(), 42);
    assert!(logs.iter().all(|log| log.address_hash == Some(LOG_EMITTER)));

    assert!(store.addresses_without_balance().await?.is_empty());
    let sender = store.address(SENDER).await.expect("sender indexed");
    assert_eq!(sender.balance_block_number, Some(20));
    assert_eq!(sender.balance, Some(U256::from(MockChain::balance_at(20))));

    let traced = store
        .internal_transactions_of(MockChain::transaction_hash(7, 1))
        .await;
    assert_eq!(traced.len(), 1);
    assert_eq!(traced[0].to_address_hash, Some(MockChain::recipient(7, 1)));

    let snapshot = fetcher.fetch_state().snapshot();
    assert_eq!(snapshot.blocks, 21);
    assert_eq!(snapshot.requeued_ranges, 0);
    assert_eq!(rpc.metrics().total_errors, 0);
    assert!(rpc.metrics().total_requests > 0);

    fetcher.stop().await?;
    drop((fetcher, rpc));
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follow_head_imports_new_blocks() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(5, 1);
    let server = MockRpcServer::start(chain.clone()).await?;
    let rpc = test_client(server.url())?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url()).build()?;
    let mut fetcher = BlockFetcher::new(config, rpc, store.clone());
    fetcher.start().await?;
    wait_until_settled(&fetcher, SETTLE_TIMEOUT).await?;
    assert_eq!(store.block_numbers().await, (0..=5).collect::<Vec<_>>());

    chain.set_head(9);
    wait_for_blocks(&store, 10, SETTLE_TIMEOUT).await?;
    wait_until_settled(&fetcher, SETTLE_TIMEOUT).await?;

    let numbers = store.block_numbers().await;
    assert_eq!(numbers.first(), Some(&0));
    assert_eq!(numbers.last(), Some(&9));
    assert_is_contiguous(&numbers);
    assert_eq!(fetcher.chain_head(), Some(9));

    fetcher.stop().await?;
    drop(fetcher);
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_block_fetch_is_requeued() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(12, 1);
    chain.fail_block(6, 2);
    let server = MockRpcServer::start(chain.clone()).await?;
    let rpc = test_client(server.url())?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url()).follow_head(false).build()?;
    let mut fetcher = BlockFetcher::new(config, rpc, store.clone());
    fetcher.start().await?;
    wait_until_settled(&fetcher, SETTLE_TIMEOUT).await?;

    assert_eq!(store.block_numbers().await, (0..=12).collect::<Vec<_>>());
    let snapshot = fetcher.fetch_state().snapshot();
    assert!(snapshot.requeued_ranges >= 2, "{snapshot:?}");
    assert!(snapshot.rpc_errors >= 2, "{snapshot:?}");
    assert!(chain.block_fetches(6) >= 1);

    fetcher.stop().await?;
    drop(fetcher);
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storage_failures_are_retried() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(8, 1);
    let server = MockRpcServer::start(chain).await?;
    let rpc = test_client(server.url())?;
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(FlakyStore::new(memory.clone(), 2));

    let config = fast_config(server.url()).follow_head(false).build()?;
    let mut fetcher = BlockFetcher::new(config, rpc, store.clone());
    fetcher.start().await?;
    wait_until_settled(&fetcher, SETTLE_TIMEOUT).await?;

    assert_eq!(store.remaining_failures(), 0);
    assert_eq!(memory.block_numbers().await, (0..=8).collect::<Vec<_>>());
    let snapshot = fetcher.fetch_state().snapshot();
    assert!(snapshot.requeued_ranges >= 2, "{snapshot:?}");
    assert!(snapshot.storage_errors >= 2, "{snapshot:?}");

    fetcher.stop().await?;
    drop(fetcher);
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_resumes_from_indexed_blocks() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(10, 1);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url()).follow_head(false).build()?;
    let mut first = BlockFetcher::new(config.clone(), test_client(server.url())?, store.clone());
    first.start().await?;
    wait_until_settled(&first, SETTLE_TIMEOUT).await?;
    first.stop().await?;

    chain.set_head(15);
    let mut second = BlockFetcher::new(config, test_client(server.url())?, store.clone());
    second.start().await?;
    wait_until_settled(&second, SETTLE_TIMEOUT).await?;
    second.stop().await?;

    assert_eq!(store.block_numbers().await, (0..=15).collect::<Vec<_>>());
    assert_eq!(chain.block_fetches(3), 1, "indexed blocks are not fetched again");
    assert_eq!(chain.block_fetches(12), 1);

    drop((first, second));
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trace_failures_are_retried() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6, 2);
    chain.fail_traces(3, 2);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url()).follow_head(false).build()?;
    let mut fetcher = BlockFetcher::new(config, test_client(server.url())?, store.clone());
    fetcher.start().await?;
    wait_until_settled(&fetcher, SETTLE_TIMEOUT).await?;

    assert_eq!(fetcher.persisted_counts().await?.internal_transactions, 14);
    for index in 0..2 {
        let hash = MockChain::transaction_hash(3, index);
        assert_eq!(store.internal_transactions_of(hash).await.len(), 1);
    }
    assert!(store
        .transactions_without_internal_transactions()
        .await?
        .is_empty());

    fetcher.stop().await?;
    drop(fetcher);
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disabled_internal_transactions_skip_tracing() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6, 1);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url())
        .follow_head(false)
        .index_internal_transactions(false)
        .build()?;
    let mut fetcher = BlockFetcher::new(config, test_client(server.url())?, store.clone());
    fetcher.start().await?;
    wait_until_settled(&fetcher, SETTLE_TIMEOUT).await?;

    let counts = fetcher.fetcher_counts().await.expect("fetcher running");
    assert_eq!(counts.internal_transactions, None);
    assert_eq!(fetcher.persisted_counts().await?.internal_transactions, 0);
    assert_eq!(store.block_numbers().await.len(), 7);
    assert_eq!(chain.calls("trace_replayTransaction"), 0);

    fetcher.stop().await?;
    drop(fetcher);
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_transactions_are_polled() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3, 1);
    chain.set_pending(3);
    let server = MockRpcServer::start(chain).await?;
    let store = Arc::new(MemoryStore::new());

    let config = fast_config(server.url())
        .follow_head(false)
        .pending_transactions_interval(Duration::from_millis(50))
        .build()?;
    let mut fetcher = BlockFetcher::new(config, test_client(server.url())?, store.clone());
    fetcher.start().await?;
    wait_for_pending(&store, 3, SETTLE_TIMEOUT).await?;

    let pending = store.pending_transactions().await;
    assert_eq!(pending.len(), 3);
    assert!(pending
        .iter()
        .all(|tx| tx.block_number.is_none() && tx.from_address_hash == Some(SENDER)));

    fetcher.stop().await?;
    drop(fetcher);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn client_authenticates_and_calls_contracts() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(42, 1);
    let server = MockRpcServer::start_with_auth(chain, "indexer", "secret").await?;
    let options = RpcClientOptions {
        max_attempts: 1,
        request_timeout: Duration::from_secs(2),
        ..RpcClientOptions::default()
    };

    let client = AsyncRpcClient::with_options(
        server.url(),
        Some(BasicAuth::new("indexer", "secret")),
        options.clone(),
    )?;
    assert_eq!(client.latest_block_number().await?, 42);

    let holder = Address::repeat_byte(0x42);
    let data = encode_call("balanceOf(address)", &[AbiValue::Address(holder)])?;
    let word = client.call_contract(SENDER, &data, None).await?;
    assert_eq!(word, format!("0x{}", encode_argument(&AbiValue::Address(holder))?));

    let rejected = AsyncRpcClient::with_options(
        server.url(),
        Some(BasicAuth::new("indexer", "wrong")),
        options,
    )?;
    assert!(rejected.latest_block_number().await.is_err());

    drop((client, rejected));
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_shutdown_does_not_wait_on_idle_client_connections() -> Result<()> {
    init_tracing();
    let server = MockRpcServer::start(MockChain::new(2, 1)).await?;
    let client = test_client(server.url())?;
    assert_eq!(client.latest_block_number().await?, 2);

    timeout(Duration::from_secs(5), server.shutdown())
        .await
        .context("mock server should stop while the client keeps its connection")?;
    drop(client);
    Ok(())
}
