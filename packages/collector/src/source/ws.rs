//! WebSocket Feeds
//!
//! JSON-RPC style subscriptions over WebSocket. Every provider shares the same
//! dial/subscribe/ack sequence and differs only in its handshake (request
//! payload, authorization header) and in how a frame is turned into raw
//! transaction bytes.

use alloy::eips::eip2718::Encodable2718;
use alloy::rpc::types::Transaction;
use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{Feed, SourceError, TxStream, KEEPALIVE_INTERVAL};
use crate::codec::hex_to_bytes;

pub const BLOXROUTE_DEFAULT_ENDPOINT: &str = "wss://api.blxrbdn.com/ws";
pub const EDEN_DEFAULT_ENDPOINT: &str = "wss://speed-eu-west.edennetwork.io";
pub const MERKLE_DEFAULT_ENDPOINT: &str = "wss://mempool.merkle.io/stream/auth/1";

/// Notification fields that may carry the hex raw transaction
const RAW_TX_FIELDS: &[&str] = &["raw_tx", "rawTx", "rlp"];

/// Turns one text frame into raw envelope bytes; `Ok(None)` skips the frame
pub type MessageDecoder = fn(&str) -> Result<Option<Vec<u8>>, SourceError>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What to send when the socket opens
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Subscribe request; providers that stream immediately have none
    pub request: Option<Value>,
    /// Value for the `Authorization` header
    pub auth_header: Option<String>,
}

/// A WebSocket subscription parameterized by handshake and decoder
pub struct WsFeed {
    endpoint: String,
    handshake: Handshake,
    decode: MessageDecoder,
}

impl WsFeed {
    pub fn new(endpoint: impl Into<String>, handshake: Handshake, decode: MessageDecoder) -> Self {
        Self {
            endpoint: endpoint.into(),
            handshake,
            decode,
        }
    }

    /// Full node: `eth_subscribe` to full pending transactions
    pub fn node(endpoint: impl Into<String>) -> Self {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newPendingTransactions", true],
        });
        Self::new(endpoint, Handshake { request: Some(request), auth_header: None }, decode_full_transaction)
    }

    /// Alchemy: provider-specific pending transaction subscription
    pub fn alchemy(endpoint: impl Into<String>) -> Self {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["alchemy_pendingTransactions", { "hashesOnly": false }],
        });
        Self::new(endpoint, Handshake { request: Some(request), auth_header: None }, decode_full_transaction)
    }

    pub fn bloxroute(endpoint: impl Into<String>, auth: impl Into<String>) -> Self {
        let request = json!({
            "id": 1,
            "method": "subscribe",
            "params": ["newTxs", { "include": ["raw_tx"] }],
        });
        Self::new(endpoint, Handshake { request: Some(request), auth_header: Some(auth.into()) }, decode_raw_tx_field)
    }

    pub fn eden(endpoint: impl Into<String>, auth: impl Into<String>) -> Self {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "subscribe",
            "params": ["rawTxs"],
        });
        Self::new(endpoint, Handshake { request: Some(request), auth_header: Some(auth.into()) }, decode_raw_tx_field)
    }

    /// Merkle streams bare hex transactions as soon as the socket opens
    pub fn merkle(endpoint: impl Into<String>, auth: impl Into<String>) -> Self {
        Self::new(endpoint, Handshake { request: None, auth_header: Some(auth.into()) }, decode_hex_frame)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn dial(&self) -> Result<Socket, SourceError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SourceError::InvalidEndpoint(format!("{}: {e}", self.endpoint)))?;

        if let Some(auth) = self.handshake.auth_header.as_deref().filter(|a| !a.is_empty()) {
            let value = HeaderValue::from_str(auth)
                .map_err(|e| SourceError::Connect(format!("invalid authorization header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = connect_async(request).await.map_err(map_ws_error)?;
        Ok(socket)
    }
}

#[async_trait]
impl Feed for WsFeed {
    async fn subscribe(&self) -> Result<TxStream, SourceError> {
        let mut socket = self.dial().await?;

        if let Some(request) = &self.handshake.request {
            socket
                .send(Message::text(request.to_string()))
                .await
                .map_err(map_ws_error)?;
            await_ack(&mut socket).await?;
        }
        debug!(endpoint = %self.endpoint, "websocket subscription active");

        let (mut sink, frames) = socket.split();
        let pinger = tokio::spawn(async move {
            let mut ticker = interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        });
        let keepalive = AbortOnDrop(pinger.abort_handle());

        let decode = self.decode;
        let stream = frames.filter_map(move |frame| {
            let _keepalive = &keepalive;
            future::ready(decode_frame(frame, decode))
        });

        Ok(Box::pin(stream))
    }
}

/// Stops the ping task once the frame stream is dropped
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn decode_frame(
    frame: Result<Message, WsError>,
    decode: MessageDecoder,
) -> Option<Result<Vec<u8>, SourceError>> {
    match frame {
        Ok(Message::Text(text)) => decode(text.as_str()).transpose(),
        Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
            Ok(text) => decode(text).transpose(),
            Err(e) => Some(Err(SourceError::Malformed(format!("binary frame is not utf-8: {e}")))),
        },
        Ok(Message::Close(frame)) => {
            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
            Some(Err(SourceError::Closed(reason)))
        }
        Ok(_) => None,
        Err(e) => Some(Err(map_ws_error(e))),
    }
}

/// Wait for the reply to the subscribe request
async fn await_ack(socket: &mut Socket) -> Result<(), SourceError> {
    while let Some(frame) = socket.next().await {
        match frame.map_err(map_ws_error)? {
            Message::Text(text) => {
                let reply: Value = serde_json::from_str(text.as_str())
                    .map_err(|e| SourceError::Malformed(format!("subscribe reply: {e}")))?;
                if let Some(err) = reply.get("error") {
                    return Err(SourceError::from_server_message(err.to_string()));
                }
                if reply.get("id").is_some() {
                    return Ok(());
                }
            }
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(SourceError::from_server_message(reason));
            }
            _ => {}
        }
    }
    Err(SourceError::Closed("closed before subscription ack".to_string()))
}

fn map_ws_error(err: WsError) -> SourceError {
    match err {
        WsError::Http(response)
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            SourceError::AuthRejected(format!("handshake returned {}", response.status()))
        }
        WsError::Http(response) => SourceError::Connect(format!("handshake returned {}", response.status())),
        WsError::ConnectionClosed | WsError::AlreadyClosed => SourceError::Closed("connection closed".to_string()),
        WsError::Io(e) => SourceError::Transport(e.to_string()),
        other => SourceError::from_server_message(other.to_string()),
    }
}

/// JSON-RPC subscription notification, or an error reply in its place
#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(default)]
    params: Option<NotificationParams>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    #[serde(default)]
    result: Option<Value>,
}

fn parse_notification(text: &str) -> Result<Option<Value>, SourceError> {
    let msg: Notification =
        serde_json::from_str(text).map_err(|e| SourceError::Malformed(format!("invalid json: {e}")))?;
    if let Some(err) = msg.error {
        return Err(SourceError::from_server_message(err.to_string()));
    }
    Ok(msg.params.and_then(|params| params.result))
}

/// Node notifications carry a full RPC transaction object
pub fn decode_full_transaction(text: &str) -> Result<Option<Vec<u8>>, SourceError> {
    let Some(result) = parse_notification(text)? else {
        return Ok(None);
    };
    let tx: Transaction = serde_json::from_value(result)
        .map_err(|e| SourceError::Malformed(format!("invalid transaction object: {e}")))?;
    Ok(Some(tx.inner.encoded_2718()))
}

/// Provider notifications carry the envelope as a hex string field
pub fn decode_raw_tx_field(text: &str) -> Result<Option<Vec<u8>>, SourceError> {
    let Some(result) = parse_notification(text)? else {
        return Ok(None);
    };
    let raw = RAW_TX_FIELDS
        .iter()
        .find_map(|field| result.get(*field))
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::Malformed("notification without raw transaction".to_string()))?;
    hex_to_bytes(raw)
        .map(Some)
        .map_err(|e| SourceError::Malformed(e.to_string()))
}

/// Each frame is a bare (optionally quoted) hex transaction
pub fn decode_hex_frame(text: &str) -> Result<Option<Vec<u8>>, SourceError> {
    let raw = text.trim().trim_matches('"');
    if raw.is_empty() {
        return Ok(None);
    }
    hex_to_bytes(raw)
        .map(Some)
        .map_err(|e| SourceError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_raw;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    const SAMPLE_RAW: &str = "0x02f873018305643b840f2c19f08503f8bfbbb2832ab980940ed1bcc400acd34593451e76f854992198995f52808498e5b12ac080a051eb99ae13fd1ace55dd93a4b36eefa5d34e115cd7b9fd5d0ffac07300cbaeb2a0782d9ad12490b45af932d8c98cb3c2fd8c02cdd6317edb36bde2df7556fa9132";
    const SAMPLE_HASH: &str = "0xbb59e550e4730da43af01b7ae6e1d05b1df501baa4119b8ab6a3427d9b3635b1";

    fn blx_notification() -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "params": { "subscription": "abc", "result": { "raw_tx": SAMPLE_RAW } },
        })
        .to_string()
    }

    // ==================== decoder tests ====================

    #[test]
    fn test_raw_tx_field_decodes_hex() {
        let bytes = decode_raw_tx_field(&blx_notification()).unwrap().unwrap();
        assert_eq!(bytes, hex_to_bytes(SAMPLE_RAW).unwrap());
    }

    #[test]
    fn test_raw_tx_field_accepts_rlp_key() {
        let msg = json!({ "params": { "result": { "rlp": SAMPLE_RAW } } }).to_string();
        assert!(decode_raw_tx_field(&msg).unwrap().is_some());
    }

    #[test]
    fn test_ack_is_skipped() {
        let ack = r#"{"jsonrpc":"2.0","id":1,"result":"0x9cef478923ff08bf67fde6c64013158d"}"#;
        assert_eq!(decode_raw_tx_field(ack).unwrap(), None);
        assert_eq!(decode_full_transaction(ack).unwrap(), None);
    }

    #[test]
    fn test_missing_raw_tx_is_malformed() {
        let msg = json!({ "params": { "result": { "txHash": "0x00" } } }).to_string();
        assert!(decode_raw_tx_field(&msg).unwrap_err().is_malformed());
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(decode_raw_tx_field("not json").unwrap_err().is_malformed());
    }

    #[test]
    fn test_error_reply_is_classified() {
        let msg = r#"{"id":1,"error":{"code":-32600,"message":"Invalid Authorization header"}}"#;
        assert!(decode_raw_tx_field(msg).unwrap_err().is_auth());
    }

    #[test]
    fn test_full_transaction_reencodes_pending_object() {
        let sample = decode_raw(&hex_to_bytes(SAMPLE_RAW).unwrap()).unwrap();
        let from = sample.envelope.recover_signer().unwrap();
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x9cef478923ff08bf67fde6c64013158d",
                "result": {
                    "blockHash": null,
                    "blockNumber": null,
                    "transactionIndex": null,
                    "from": from,
                    "hash": SAMPLE_HASH,
                    "type": "0x2",
                    "chainId": "0x1",
                    "nonce": "0x5643b",
                    "maxPriorityFeePerGas": "0xf2c19f0",
                    "maxFeePerGas": "0x3f8bfbbb2",
                    "gas": "0x2ab980",
                    "to": "0x0ed1bcc400acd34593451e76f854992198995f52",
                    "value": "0x0",
                    "input": "0x98e5b12a",
                    "accessList": [],
                    "v": "0x0",
                    "yParity": "0x0",
                    "r": "0x51eb99ae13fd1ace55dd93a4b36eefa5d34e115cd7b9fd5d0ffac07300cbaeb2",
                    "s": "0x782d9ad12490b45af932d8c98cb3c2fd8c02cdd6317edb36bde2df7556fa9132"
                }
            }
        })
        .to_string();

        let bytes = decode_full_transaction(&msg).unwrap().unwrap();
        assert_eq!(bytes, hex_to_bytes(SAMPLE_RAW).unwrap());
        assert_eq!(decode_raw(&bytes).unwrap().hash_hex(), SAMPLE_HASH);
    }

    #[test]
    fn test_full_transaction_rejects_garbage_result() {
        let msg = json!({ "params": { "result": { "hash": 1 } } }).to_string();
        assert!(decode_full_transaction(&msg).unwrap_err().is_malformed());
    }

    #[test]
    fn test_hex_frame_quoted_and_bare() {
        let expected = hex_to_bytes(SAMPLE_RAW).unwrap();
        assert_eq!(decode_hex_frame(SAMPLE_RAW).unwrap().unwrap(), expected);
        assert_eq!(decode_hex_frame(&format!("\"{SAMPLE_RAW}\"\n")).unwrap().unwrap(), expected);
        assert_eq!(decode_hex_frame("  ").unwrap(), None);
        assert!(decode_hex_frame("0xzz").unwrap_err().is_malformed());
    }

    // ==================== socket tests ====================

    #[tokio::test]
    async fn test_bloxroute_subscribe_and_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let check_auth = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                assert_eq!(req.headers().get(AUTHORIZATION).unwrap(), "secret");
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, check_auth).await.unwrap();

            let request = ws.next().await.unwrap().unwrap();
            assert!(request.to_text().unwrap().contains("newTxs"));

            ws.send(Message::text(r#"{"id":1,"result":"sub-1"}"#)).await.unwrap();
            ws.send(Message::text(blx_notification())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let feed = WsFeed::bloxroute(format!("ws://{addr}"), "secret");
        let mut stream = feed.subscribe().await.unwrap();
        let raw = stream.next().await.unwrap().unwrap();
        assert_eq!(raw, hex_to_bytes(SAMPLE_RAW).unwrap());
    }

    #[tokio::test]
    async fn test_unauthorized_handshake_is_auth_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let reject = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                let mut resp = ErrorResponse::new(None);
                *resp.status_mut() = StatusCode::UNAUTHORIZED;
                Err(resp)
            };
            let _ = tokio_tungstenite::accept_hdr_async(tcp, reject).await;
        });

        let feed = WsFeed::eden(format!("ws://{addr}"), "wrong");
        let err = feed.subscribe().await.err().unwrap();
        assert!(err.is_auth(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_subscribe_error_reply_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::text(r#"{"id":1,"error":{"message":"unknown method"}}"#))
                .await
                .unwrap();
        });

        let feed = WsFeed::node(format!("ws://{addr}"));
        let err = feed.subscribe().await.err().unwrap();
        assert!(matches!(err, SourceError::SubscribeRejected(_)), "unexpected error: {err}");
    }
}
