//! JSON-RPC implementation of [L1Client]: HTTP for queries, websocket for `eth_subscribe`.

use crate::abi::{parse_hex_b256, parse_hex_bytes, parse_hex_u64, RawLog};
use crate::client::{ClientError, L1Client, L1Transaction, LogFilter, LogStream};
use crate::config::L1Config;
use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct JsonRpcClient {
    http: reqwest::Client,
    http_url: String,
    ws_url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(http_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            http_url: http_url.into(),
            ws_url: ws_url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &L1Config) -> Self {
        Self::new(config.http_url.clone(), config.ws_url.clone())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        let resp = self.http.post(&self.http_url).json(&body).send().await?;
        let json: Value = resp.json().await?;
        if let Some(err) = json.get("error") {
            return Err(ClientError::Rpc(format!("{method}: {err}")));
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| ClientError::Rpc(format!("{method}: missing result")))
    }

    async fn get_logs(&self, filter: Value) -> Result<Vec<Value>, ClientError> {
        match self.call("eth_getLogs", json!([filter])).await? {
            Value::Array(logs) => Ok(logs),
            other => Err(ClientError::Decode(format!("eth_getLogs returned {other}"))),
        }
    }
}

fn quantity(value: &Value, what: &str) -> Result<u64, ClientError> {
    let s = value
        .as_str()
        .ok_or_else(|| ClientError::Decode(format!("{what} not a string")))?;
    parse_hex_u64(s).map_err(ClientError::Decode)
}

/// Parse each log, skipping (and logging) malformed entries and those the filter rejects.
fn collect_logs(raw: Vec<Value>, filter: &LogFilter, client_side: bool) -> Vec<RawLog> {
    raw.iter()
        .filter_map(|v| {
            RawLog::from_json(v)
                .map_err(|e| tracing::debug!(reason = %e, "malformed log skipped"))
                .ok()
        })
        .filter(|log| !client_side || filter.matches(log))
        .collect()
}

#[async_trait]
impl L1Client for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        let result = self.call("eth_chainId", json!([])).await?;
        quantity(&result, "chainId")
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        quantity(&result, "blockNumber")
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ClientError> {
        let logs = match self.get_logs(filter.to_json()).await {
            Ok(raw) => collect_logs(raw, filter, false),
            Err(e) => {
                // Some nodes reject topic filters; query by address and filter here.
                tracing::debug!(reason = %e, "eth_getLogs with topic filter failed, trying address-only");
                let address_only = LogFilter {
                    topics: Vec::new(),
                    ..filter.clone()
                };
                let raw = self.get_logs(address_only.to_json()).await?;
                collect_logs(raw, filter, true)
            }
        };
        Ok(logs)
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, ClientError> {
        let (ws_stream, _) = connect_async(&self.ws_url)
            .await
            .map_err(|e| ClientError::WebSocket(format!("connect: {e}")))?;
        let (mut sender, mut receiver) = ws_stream.split();

        let live_filter = LogFilter {
            from_block: None,
            to_block: None,
            ..filter.clone()
        };
        let params = json!(["logs", live_filter.to_json()]);
        let client_side = match subscribe(&mut sender, &mut receiver, params).await? {
            Ok(sub_id) => {
                tracing::info!(%sub_id, "log subscription established");
                false
            }
            Err(message) if message.contains("data did not match") || message.contains("variant") => {
                tracing::warn!("RPC does not support logs filter, using client-side filter");
                let sub_id = subscribe(&mut sender, &mut receiver, json!(["logs"]))
                    .await?
                    .map_err(|m| ClientError::Rpc(format!("eth_subscribe: {m}")))?;
                tracing::info!(%sub_id, "unfiltered log subscription established");
                true
            }
            Err(message) => return Err(ClientError::Rpc(format!("eth_subscribe: {message}"))),
        };

        let stream = futures_util::stream::unfold(
            (sender, receiver, live_filter),
            move |(sender, mut receiver, filter)| async move {
                loop {
                    let text = match receiver.next().await? {
                        Ok(Message::Text(t)) => t,
                        Ok(Message::Close(_)) => return None,
                        Ok(_) => continue,
                        Err(e) => {
                            let err = ClientError::WebSocket(e.to_string());
                            return Some((Err(err), (sender, receiver, filter)));
                        }
                    };
                    let v: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            let err = ClientError::Decode(format!("ws message: {e}"));
                            return Some((Err(err), (sender, receiver, filter)));
                        }
                    };
                    if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                        continue;
                    }
                    let Some(result) = v.get("params").and_then(|p| p.get("result")) else {
                        continue;
                    };
                    let log = match RawLog::from_json(result) {
                        Ok(log) => log,
                        Err(e) => {
                            tracing::debug!(reason = %e, "malformed subscription log skipped");
                            continue;
                        }
                    };
                    if client_side && !filter.matches(&log) {
                        continue;
                    }
                    return Some((Ok(log), (sender, receiver, filter)));
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<L1Transaction>, ClientError> {
        let result = self
            .call("eth_getTransactionByHash", json!([format!("{hash}")]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let field = |name: &str| {
            result
                .get(name)
                .and_then(|v| v.as_str())
                .ok_or_else(|| ClientError::Decode(format!("transaction missing {name}")))
        };
        let tx_hash = parse_hex_b256(field("hash")?).map_err(ClientError::Decode)?;
        let input = parse_hex_bytes(field("input")?).map_err(ClientError::Decode)?;
        let block_number = match result.get("blockNumber") {
            Some(Value::String(s)) => Some(parse_hex_u64(s).map_err(ClientError::Decode)?),
            _ => None,
        };
        Ok(Some(L1Transaction {
            hash: tx_hash,
            block_number,
            input: Bytes::from(input),
        }))
    }
}

/// Send `eth_subscribe` and wait for its response. The inner `Err` carries the node's error
/// message so the caller can decide on a fallback.
async fn subscribe(
    sender: &mut SplitSink<WsStream, Message>,
    receiver: &mut SplitStream<WsStream>,
    params: Value,
) -> Result<Result<String, String>, ClientError> {
    let req = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": params
    });
    let text = serde_json::to_string(&req).map_err(|e| ClientError::Decode(e.to_string()))?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| ClientError::WebSocket(format!("send subscribe: {e}")))?;

    loop {
        let msg = timeout(SUBSCRIBE_TIMEOUT, receiver.next())
            .await
            .map_err(|_| ClientError::Timeout("subscribe response"))?
            .ok_or(ClientError::SubscriptionClosed)?
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err(ClientError::SubscriptionClosed),
            _ => continue,
        };
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ClientError::Decode(format!("subscribe response: {e}")))?;
        if let Some(err) = v.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            return Ok(Err(message));
        }
        let id = v["result"]
            .as_str()
            .ok_or_else(|| ClientError::Decode("subscribe response without id".into()))?;
        return Ok(Ok(id.to_string()));
    }
}
