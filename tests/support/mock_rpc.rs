use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use base64::Engine;
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const MINER: Address = Address::new([0xaa; 20]);
pub const SENDER: Address = Address::new([0xbb; 20]);
pub const LOG_EMITTER: Address = Address::new([0xcc; 20]);
pub const CREATED_CONTRACT: Address = Address::new([0x77; 20]);

const BLOCK_TAG: u8 = 0xb1;
const TX_TAG: u8 = 0x7a;
const PENDING_TX_TAG: u8 = 0x9e;
const BALANCE_UNIT: u128 = 1_000_000_000_000_000;
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Deterministic EVM chain served by [`MockRpcServer`]. Block `n` carries
/// `txs_per_block` transactions from [`SENDER`], each with one receipt log
/// and one call trace.
#[derive(Clone)]
pub struct MockChain {
    head: Arc<AtomicU64>,
    txs_per_block: u64,
    state: Arc<Mutex<MockChainState>>,
}

#[derive(Default)]
struct MockChainState {
    pending: u64,
    conflicting_block: Option<u64>,
    block_failures: HashMap<u64, usize>,
    trace_failures: HashMap<u64, usize>,
    block_fetches: HashMap<u64, usize>,
    calls: HashMap<String, usize>,
}

impl MockChain {
    pub fn new(head: u64, txs_per_block: u64) -> Self {
        Self {
            head: Arc::new(AtomicU64::new(head)),
            txs_per_block,
            state: Arc::new(Mutex::new(MockChainState::default())),
        }
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Serves `count` transactions in the pending block.
    pub fn set_pending(&self, count: u64) {
        self.lock().pending = count;
    }

    /// Makes every trace of block `number` create [`CREATED_CONTRACT`] with
    /// code that differs per transaction.
    pub fn set_conflicting_creates(&self, number: u64) {
        self.lock().conflicting_block = Some(number);
    }

    /// Fails the next `times` requests for block `number`.
    pub fn fail_block(&self, number: u64, times: usize) {
        self.lock().block_failures.insert(number, times);
    }

    /// Fails the next `times` trace requests for transactions of block `number`.
    pub fn fail_traces(&self, number: u64, times: usize) {
        self.lock().trace_failures.insert(number, times);
    }

    /// Successful `eth_getBlockByNumber` answers served for block `number`.
    pub fn block_fetches(&self, number: u64) -> usize {
        self.lock().block_fetches.get(&number).copied().unwrap_or(0)
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn transaction_hash(number: u64, index: u64) -> B256 {
        tagged_hash(TX_TAG, number, index)
    }

    pub fn block_hash(number: u64) -> B256 {
        tagged_hash(BLOCK_TAG, number, 0)
    }

    pub fn recipient(number: u64, index: u64) -> Address {
        let mut bytes = [0x10u8; 20];
        bytes[10..18].copy_from_slice(&number.to_be_bytes());
        bytes[18..].copy_from_slice(&(index as u16).to_be_bytes());
        Address::from(bytes)
    }

    /// Balance served for any address at `block_number`.
    pub fn balance_at(block_number: u64) -> u128 {
        u128::from(block_number + 1) * BALANCE_UNIT
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockChainState> {
        self.state.lock().expect("mock chain poisoned")
    }

    fn record_call(&self, method: &str) {
        *self.lock().calls.entry(method.to_string()).or_default() += 1;
    }

    fn take_failure(failures: &mut HashMap<u64, usize>, number: u64) -> bool {
        match failures.get_mut(&number) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn block_json(&self, number: u64) -> Result<Value, (i64, String)> {
        if number > self.head() {
            return Ok(Value::Null);
        }
        {
            let mut state = self.lock();
            if Self::take_failure(&mut state.block_failures, number) {
                return Err((-32000, format!("injected failure for block {number}")));
            }
            *state.block_fetches.entry(number).or_default() += 1;
        }

        let transactions: Vec<Value> = (0..self.txs_per_block)
            .map(|index| {
                json!({
                    "hash": Self::transaction_hash(number, index),
                    "blockNumber": quantity(number),
                    "blockHash": Self::block_hash(number),
                    "transactionIndex": quantity(index),
                    "from": SENDER,
                    "to": Self::recipient(number, index),
                    "value": "0x1",
                    "input": "0x",
                    "gas": "0x5208",
                    "gasPrice": "0x3b9aca00",
                    "nonce": quantity(number * self.txs_per_block + index),
                })
            })
            .collect();

        let parent = if number == 0 {
            B256::ZERO
        } else {
            Self::block_hash(number - 1)
        };

        Ok(json!({
            "number": quantity(number),
            "hash": Self::block_hash(number),
            "parentHash": parent,
            "miner": MINER,
            "timestamp": quantity(1_700_000_000 + number * 12),
            "gasUsed": quantity(21_000 * self.txs_per_block),
            "gasLimit": "0x1c9c380",
            "transactions": transactions,
        }))
    }

    fn pending_block_json(&self) -> Value {
        let count = self.lock().pending;
        if count == 0 {
            return Value::Null;
        }
        let transactions: Vec<Value> = (0..count)
            .map(|index| {
                json!({
                    "hash": tagged_hash(PENDING_TX_TAG, 0, index),
                    "blockNumber": null,
                    "blockHash": null,
                    "transactionIndex": null,
                    "from": SENDER,
                    "to": Self::recipient(u64::MAX, index),
                    "value": "0x2",
                    "input": "0x",
                    "gas": "0x5208",
                    "gasPrice": "0x3b9aca00",
                    "nonce": quantity(index),
                })
            })
            .collect();

        json!({
            "number": null,
            "hash": null,
            "parentHash": Self::block_hash(self.head()),
            "miner": null,
            "timestamp": quantity(1_700_000_000),
            "gasUsed": "0x0",
            "gasLimit": "0x1c9c380",
            "transactions": transactions,
        })
    }

    fn receipt_json(&self, hash: B256) -> Value {
        let Some((number, index)) = locate(hash).filter(|(n, _)| *n <= self.head()) else {
            return Value::Null;
        };
        json!({
            "transactionHash": hash,
            "blockNumber": quantity(number),
            "blockHash": Self::block_hash(number),
            "status": "0x1",
            "gasUsed": "0x5208",
            "cumulativeGasUsed": quantity(21_000 * (index + 1)),
            "contractAddress": null,
            "logs": [{
                "address": LOG_EMITTER,
                "blockNumber": quantity(number),
                "blockHash": Self::block_hash(number),
                "transactionHash": hash,
                "logIndex": quantity(index),
                "data": "0x",
                "topics": [B256::repeat_byte(0x01)],
            }],
        })
    }

    fn trace_json(&self, hash: B256) -> Result<Value, (i64, String)> {
        let Some((number, index)) = locate(hash).filter(|(n, _)| *n <= self.head()) else {
            return Ok(Value::Null);
        };
        let conflicting = {
            let mut state = self.lock();
            if Self::take_failure(&mut state.trace_failures, number) {
                return Err((-32000, format!("injected trace failure for {hash}")));
            }
            state.conflicting_block == Some(number)
        };

        let trace = if conflicting {
            json!({
                "type": "create",
                "action": {
                    "from": SENDER,
                    "gas": "0x10000",
                    "init": "0x6080",
                    "value": "0x0",
                },
                "result": {
                    "gasUsed": "0x100",
                    "address": CREATED_CONTRACT,
                    "code": format!("0x60{:02x}", index),
                },
                "traceAddress": [],
                "subtraces": 0,
            })
        } else {
            json!({
                "type": "call",
                "action": {
                    "callType": "call",
                    "from": SENDER,
                    "to": Self::recipient(number, index),
                    "gas": "0x5208",
                    "input": "0x",
                    "value": "0x1",
                },
                "result": { "gasUsed": "0x0", "output": "0x" },
                "traceAddress": [],
                "subtraces": 0,
            })
        };

        Ok(json!({ "output": "0x", "trace": [trace] }))
    }
}

fn tagged_hash(tag: u8, number: u64, index: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[16..24].copy_from_slice(&number.to_be_bytes());
    bytes[24..].copy_from_slice(&index.to_be_bytes());
    B256::from(bytes)
}

fn locate(hash: B256) -> Option<(u64, u64)> {
    if hash[0] != TX_TAG {
        return None;
    }
    let number = u64::from_be_bytes(hash[16..24].try_into().ok()?);
    let index = u64::from_be_bytes(hash[24..].try_into().ok()?);
    Some((number, index))
}

fn quantity(value: u64) -> String {
    format!("{value:#x}")
}

fn parse_quantity(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.strip_prefix("0x")?, 16).ok()
}

pub struct MockRpcServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockRpcServer {
    pub async fn start(chain: MockChain) -> Result<Self> {
        Self::start_inner(chain, None).await
    }

    /// Rejects requests whose basic auth header does not match.
    pub async fn start_with_auth(chain: MockChain, user: &str, password: &str) -> Result<Self> {
        let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        Self::start_inner(chain, Some(format!("Basic {credentials}"))).await
    }

    async fn start_inner(chain: MockChain, expected_auth: Option<String>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock RPC listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let expected_auth = Arc::new(expected_auth);

        let make_service = make_service_fn(move |_| {
            let chain = chain.clone();
            let expected_auth = expected_auth.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    serve_request(chain.clone(), expected_auth.clone(), req)
                }))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock RPC server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            // Graceful shutdown waits on keep-alive connections held by clients.
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

async fn serve_request(
    chain: MockChain,
    expected_auth: Arc<Option<String>>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(plain_response(StatusCode::METHOD_NOT_ALLOWED, "Unsupported method".into()));
    }

    if let Some(expected) = expected_auth.as_ref() {
        let provided = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Ok(plain_response(StatusCode::UNAUTHORIZED, "Unauthorized".into()));
        }
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read body: {err}"),
            ))
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                format!("invalid JSON payload: {err}"),
            ))
        }
    };

    let response_value = match payload {
        Value::Array(calls) => Value::Array(
            calls
                .into_iter()
                .map(|call| handle_call(&chain, call))
                .collect(),
        ),
        call => handle_call(&chain, call),
    };

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn plain_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

fn handle_call(chain: &MockChain, call: Value) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = call
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    chain.record_call(&method);

    let first_str = params.first().and_then(Value::as_str);

    match method.as_str() {
        "eth_blockNumber" => success(id, Value::String(quantity(chain.head()))),
        "eth_getBlockByNumber" => match first_str {
            Some("pending") => success(id, chain.pending_block_json()),
            Some("latest") => respond(id, chain.block_json(chain.head())),
            Some(raw) => match parse_quantity(raw) {
                Some(number) => respond(id, chain.block_json(number)),
                None => error(id, -32602, format!("invalid block number {raw}")),
            },
            None => error(id, -32602, "missing block number"),
        },
        "eth_getTransactionReceipt" => {
            match first_str.and_then(|raw| raw.parse::<B256>().ok()) {
                Some(hash) => success(id, chain.receipt_json(hash)),
                None => error(id, -32602, "invalid transaction hash"),
            }
        }
        "trace_replayTransaction" => match first_str.and_then(|raw| raw.parse::<B256>().ok()) {
            Some(hash) => respond(id, chain.trace_json(hash)),
            None => error(id, -32602, "invalid transaction hash"),
        },
        "eth_getBalance" => {
            let block = params.get(1).and_then(Value::as_str).and_then(parse_quantity);
            match block {
                Some(number) => success(
                    id,
                    Value::String(format!("{:#x}", MockChain::balance_at(number))),
                ),
                None => error(id, -32602, "invalid block tag"),
            }
        }
        "eth_call" => {
            // Echoes the last argument word, enough for single-argument views.
            let data = params
                .first()
                .and_then(|call| call.get("data"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let word = if data.len() >= 2 + 8 + 64 {
                &data[data.len() - 64..]
            } else {
                "0000000000000000000000000000000000000000000000000000000000000000"
            };
            success(id, Value::String(format!("0x{word}")))
        }
        _ => error(id, -32601, format!("unknown method {method}")),
    }
}

fn respond(id: Value, result: Result<Value, (i64, String)>) -> Value {
    match result {
        Ok(value) => success(id, value),
        Err((code, message)) => error(id, code, message),
    }
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}
