// Websocket JSON-RPC client for the upstream node.
//
// One background task owns the socket and demultiplexes traffic: plain
// request/response pairs are matched back to callers by request id, and
// `eth_subscription` notifications are routed to the channel registered
// for their subscription id. Transport failure fails every pending call
// and fires each subscription's error channel; the subscription is not
// restartable.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::chain::{ChainAdapter, ChainBlock, ChainHeader, ChainTransaction, HeadSubscription};
use crate::error::{Error, Result};

const HEADER_CHANNEL_CAPACITY: usize = 64;

enum Command {
    Call {
        method: &'static str,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        reply: oneshot::Sender<Result<HeadSubscription>>,
    },
}

/// Handle on a connected node. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct EthNodeClient {
    commands: mpsc::Sender<Command>,
}

impl EthNodeClient {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let (socket, _) = connect_async(endpoint)
            .await
            .map_err(|err| Error::adapter(format!("connecting to {}: {}", endpoint, err)))?;

        let (commands, command_rx) = mpsc::channel(16);
        tokio::spawn(run_socket(socket, command_rx));

        Ok(EthNodeClient { commands })
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Call { method, params, reply })
            .await
            .map_err(|_| Error::adapter("connection task gone"))?;
        response
            .await
            .map_err(|_| Error::adapter("connection closed before response"))?
    }
}

impl ChainAdapter for EthNodeClient {
    async fn subscribe_new_heads(&self) -> Result<HeadSubscription> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { reply })
            .await
            .map_err(|_| Error::adapter("connection task gone"))?;
        response
            .await
            .map_err(|_| Error::adapter("connection closed before subscription confirm"))?
    }

    async fn fetch_block(&self, hash: &str) -> Result<ChainBlock> {
        let result = self.call("eth_getBlockByHash", json!([hash, true])).await?;
        if result.is_null() {
            return Err(Error::adapter(format!("node has no block {}", hash)));
        }
        let raw: RawBlock = serde_json::from_value(result)
            .map_err(|err| Error::adapter(format!("malformed block payload: {}", err)))?;
        raw.into_chain_block()
    }

    async fn fetch_balance_at(&self, address: &str, number: &BigUint) -> Result<BigUint> {
        let tag = format!("0x{:x}", number);
        let result = self.call("eth_getBalance", json!([address, tag])).await?;
        let quantity = result
            .as_str()
            .ok_or_else(|| Error::adapter("eth_getBalance returned a non-string quantity"))?;
        parse_big_quantity(quantity)
    }
}

struct Subscription {
    sink: mpsc::Sender<ChainHeader>,
    errors: oneshot::Sender<Error>,
}

async fn run_socket(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    // Subscription-confirm replies waiting on their eth_subscribe response.
    let mut pending_subscribes: HashMap<u64, oneshot::Sender<Result<HeadSubscription>>> = HashMap::new();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    let failure: Option<String> = loop {
        tokio::select! {
            command = commands.recv() => {
                let command = match command {
                    Some(command) => command,
                    // Every client handle dropped; close the socket.
                    None => break None,
                };

                let id = next_id;
                next_id += 1;

                let (method, params) = match command {
                    Command::Call { method, params, reply } => {
                        pending.insert(id, reply);
                        (method, params)
                    }
                    Command::Subscribe { reply } => {
                        pending_subscribes.insert(id, reply);
                        ("eth_subscribe", json!(["newHeads"]))
                    }
                };

                let request = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                    "params": params,
                })
                .to_string();

                if let Err(err) = socket.send(Message::Text(request.into())).await {
                    break Some(format!("websocket send failed: {}", err));
                }
            }

            message = socket.next() => {
                match message {
                    Some(Ok(Message::Text(payload))) => {
                        dispatch_frame(
                            payload.as_str(),
                            &mut pending,
                            &mut pending_subscribes,
                            &mut subscriptions,
                        )
                        .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(err) = socket.send(Message::Pong(data)).await {
                            break Some(format!("websocket send failed: {}", err));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Some("websocket closed by remote".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break Some(format!("websocket receive failed: {}", err));
                    }
                }
            }
        }
    };

    if let Some(message) = failure {
        warn!(error = %message, "node connection failed");
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(Error::adapter(message.clone())));
        }
        for (_, reply) in pending_subscribes.drain() {
            let _ = reply.send(Err(Error::adapter(message.clone())));
        }
        for (_, subscription) in subscriptions.drain() {
            let _ = subscription.errors.send(Error::adapter(message.clone()));
        }
    }
}

async fn dispatch_frame(
    payload: &str,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
    pending_subscribes: &mut HashMap<u64, oneshot::Sender<Result<HeadSubscription>>>,
    subscriptions: &mut HashMap<String, Subscription>,
) {
    let frame: RpcFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "dropping malformed frame");
            return;
        }
    };

    // Subscription notification.
    if let Some(params) = frame.params {
        if !subscriptions.contains_key(&params.subscription) {
            return;
        }

        let header = match serde_json::from_value::<RawHead>(params.result)
            .map_err(|err| Error::adapter(format!("malformed header: {}", err)))
            .and_then(|raw| raw.into_chain_header())
        {
            Ok(header) => header,
            Err(err) => {
                warn!(error = %err, "dropping malformed header notification");
                return;
            }
        };

        let delivered = match subscriptions.get(&params.subscription) {
            Some(subscription) => subscription.sink.send(header).await.is_ok(),
            None => true,
        };
        if !delivered {
            debug!("header consumer gone, dropping subscription");
            subscriptions.remove(&params.subscription);
        }
        return;
    }

    let id = match frame.id {
        Some(id) => id,
        None => return,
    };

    let outcome: Result<Value> = match frame.error {
        Some(err) => Err(Error::adapter(format!("rpc error {}: {}", err.code, err.message))),
        None => Ok(frame.result.unwrap_or(Value::Null)),
    };

    if let Some(reply) = pending.remove(&id) {
        let _ = reply.send(outcome);
        return;
    }

    if let Some(reply) = pending_subscribes.remove(&id) {
        match outcome.and_then(|value| {
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::adapter("eth_subscribe returned a non-string id"))
        }) {
            Ok(sub_id) => {
                let (sink, headers) = mpsc::channel(HEADER_CHANNEL_CAPACITY);
                let (errors_tx, errors) = oneshot::channel();
                subscriptions.insert(sub_id, Subscription { sink, errors: errors_tx });
                let _ = reply.send(Ok(HeadSubscription { headers, errors }));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

#[derive(Deserialize)]
struct RpcFrame {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcErrorBody>,
    params: Option<RpcSubscriptionParams>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcSubscriptionParams {
    subscription: String,
    result: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHead {
    hash: String,
    parent_hash: String,
    number: String,
}

impl RawHead {
    fn into_chain_header(self) -> Result<ChainHeader> {
        Ok(ChainHeader {
            hash: self.hash,
            parent_hash: self.parent_hash,
            number: parse_big_quantity(&self.number)?,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    hash: String,
    size: String,
    parent_hash: String,
    sha3_uncles: String,
    miner: String,
    state_root: String,
    transactions_root: String,
    receipts_root: String,
    logs_bloom: String,
    difficulty: String,
    number: String,
    gas_limit: String,
    gas_used: String,
    timestamp: String,
    extra_data: String,
    mix_hash: String,
    nonce: String,
    base_fee_per_gas: Option<String>,
    transactions: Vec<RawTransaction>,
}

impl RawBlock {
    fn into_chain_block(self) -> Result<ChainBlock> {
        let transactions = self
            .transactions
            .into_iter()
            .map(RawTransaction::into_chain_transaction)
            .collect::<Result<Vec<_>>>()?;

        Ok(ChainBlock {
            hash: self.hash,
            size: parse_quantity(&self.size)?,
            parent_hash: self.parent_hash,
            uncle_hash: self.sha3_uncles,
            coinbase: self.miner,
            state_root: self.state_root,
            tx_root: self.transactions_root,
            receipt_root: self.receipts_root,
            bloom: parse_hex_bytes(&self.logs_bloom)?,
            difficulty: parse_big_quantity(&self.difficulty)?,
            number: parse_big_quantity(&self.number)?,
            gas_limit: parse_quantity(&self.gas_limit)?,
            gas_used: parse_quantity(&self.gas_used)?,
            time: parse_quantity(&self.timestamp)?,
            extra: parse_hex_bytes(&self.extra_data)?,
            mix_digest: self.mix_hash,
            nonce: parse_big_quantity(&self.nonce)?,
            // Pre-London blocks carry no base fee.
            base_fee: match self.base_fee_per_gas {
                Some(fee) => parse_big_quantity(&fee)?,
                None => BigUint::from(0u8),
            },
            transactions,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: String,
    // Not part of the standard wire format; some nodes report it.
    size: Option<String>,
    from: String,
    to: Option<String>,
    #[serde(rename = "type")]
    tx_type: Option<String>,
    chain_id: Option<String>,
    input: String,
    gas: String,
    gas_price: Option<String>,
    max_priority_fee_per_gas: Option<String>,
    max_fee_per_gas: Option<String>,
    value: String,
    nonce: String,
}

impl RawTransaction {
    fn into_chain_transaction(self) -> Result<ChainTransaction> {
        Ok(ChainTransaction {
            hash: self.hash,
            size: match self.size {
                Some(size) => parse_quantity(&size)?,
                None => 0,
            },
            from: self.from,
            to: self.to,
            tx_type: match self.tx_type {
                Some(kind) => parse_quantity(&kind)? as u8,
                None => 0,
            },
            chain_id: parse_optional_big(self.chain_id)?,
            data: parse_hex_bytes(&self.input)?,
            gas: parse_quantity(&self.gas)?,
            gas_price: parse_optional_big(self.gas_price)?,
            gas_tip_cap: parse_optional_big(self.max_priority_fee_per_gas)?,
            gas_fee_cap: parse_optional_big(self.max_fee_per_gas)?,
            value: parse_big_quantity(&self.value)?,
            nonce: parse_big_quantity(&self.nonce)?,
        })
    }
}

fn parse_optional_big(quantity: Option<String>) -> Result<BigUint> {
    match quantity {
        Some(quantity) => parse_big_quantity(&quantity),
        None => Ok(BigUint::from(0u8)),
    }
}

/// Decode a 0x-prefixed hex quantity into a u64.
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    let digits = quantity.trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::adapter(format!("invalid hex quantity: {}", quantity)))
}

/// Decode a 0x-prefixed hex quantity of arbitrary width.
pub fn parse_big_quantity(quantity: &str) -> Result<BigUint> {
    let digits = quantity.trim_start_matches("0x");
    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| Error::adapter(format!("invalid hex quantity: {}", quantity)))
}

/// Decode 0x-prefixed hex data into raw bytes.
pub fn parse_hex_bytes(data: &str) -> Result<Vec<u8>> {
    hex::decode(data.trim_start_matches("0x"))
        .map_err(|_| Error::adapter(format!("invalid hex data: {}", data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert!(parse_quantity("0xzz").is_err());

        let big = parse_big_quantity("0xffffffffffffffffffffffffffffffff").unwrap();
        assert_eq!(big.to_str_radix(10), "340282366920938463463374607431768211455");
    }

    #[test]
    fn converts_a_raw_block() {
        let raw: RawBlock = serde_json::from_value(serde_json::json!({
            "hash": "0xaa",
            "size": "0x220",
            "parentHash": "0xbb",
            "sha3Uncles": "0xcc",
            "miner": "0xdd",
            "stateRoot": "0xee",
            "transactionsRoot": "0xff",
            "receiptsRoot": "0x11",
            "logsBloom": "0x00",
            "difficulty": "0xa",
            "number": "0x10",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "timestamp": "0x61bc5f00",
            "extraData": "0x",
            "mixHash": "0x22",
            "nonce": "0x539",
            "baseFeePerGas": "0x7",
            "transactions": [{
                "hash": "0x33",
                "from": "0x44",
                "to": null,
                "type": "0x2",
                "chainId": "0x1",
                "input": "0x6001",
                "gas": "0x5208",
                "gasPrice": "0x9",
                "maxPriorityFeePerGas": "0x1",
                "maxFeePerGas": "0x9",
                "value": "0x0",
                "nonce": "0x3"
            }]
        }))
        .unwrap();

        let block = raw.into_chain_block().unwrap();
        assert_eq!(block.number, BigUint::from(16u8));
        assert_eq!(block.gas_used, 21000);
        assert_eq!(block.base_fee, BigUint::from(7u8));
        assert_eq!(block.transactions.len(), 1);

        let tx = &block.transactions[0];
        assert_eq!(tx.to, None);
        assert_eq!(tx.tx_type, 2);
        assert_eq!(tx.data, vec![0x60, 0x01]);
        assert_eq!(tx.size, 0);
    }

    #[test]
    fn missing_base_fee_reads_as_zero() {
        let raw: RawBlock = serde_json::from_value(serde_json::json!({
            "hash": "0xaa", "size": "0x1", "parentHash": "0xbb", "sha3Uncles": "0xcc",
            "miner": "0xdd", "stateRoot": "0xee", "transactionsRoot": "0xff",
            "receiptsRoot": "0x11", "logsBloom": "0x00", "difficulty": "0x1",
            "number": "0x1", "gasLimit": "0x1", "gasUsed": "0x0", "timestamp": "0x1",
            "extraData": "0x", "mixHash": "0x22", "nonce": "0x0",
            "transactions": []
        }))
        .unwrap();
        assert_eq!(raw.into_chain_block().unwrap().base_fee, BigUint::from(0u8));
    }
}
