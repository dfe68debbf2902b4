//! JSON-RPC 2.0 link over a WebSocket.
//!
//! One driver task owns the socket. Calls register a oneshot keyed by request
//! id; responses are routed back by id, and `workspaceInstanceUpdate`
//! notifications are forwarded to the session's update queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;
use warden_core::WorkspaceInstance;

use crate::connection::{Connector, Link};
use crate::error::{Error, Result};

/// API path appended to the link address.
pub const DEFAULT_API_PATH: &str = "/api/v1";

/// Notification carrying an instance update.
pub const INSTANCE_UPDATE: &str = "workspaceInstanceUpdate";

const LINK_SCHEME: &str = "wss://";
const OUTBOUND_CAPACITY: usize = 32;

/// Link address for a server host: any `scheme://` prefix is replaced by `wss://`.
#[must_use]
pub fn link_address(host: &str) -> String {
    let bare = host.split_once("://").map_or(host, |(_, rest)| rest);
    format!("{LINK_SCHEME}{}", bare.trim_end_matches('/'))
}

/// Opens [`WsLink`]s to one endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
    token: Option<String>,
    call_timeout: Duration,
}

impl WsConnector {
    /// Connector for the server at `host`, on the default API path.
    pub fn new(host: &str) -> Result<Self> {
        Self::with_endpoint(&format!("{}{DEFAULT_API_PATH}", link_address(host)))
    }

    /// Connector for an explicit `ws://` or `wss://` endpoint.
    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::invalid_config(format!("link endpoint '{endpoint}': {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::invalid_config(format!(
                "link endpoint '{endpoint}' is not a WebSocket URL"
            )));
        }
        Ok(Self {
            endpoint,
            token: None,
            call_timeout: Duration::from_secs(10),
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

fn handshake_error(e: WsError) -> Error {
    match e {
        WsError::Http(response) => {
            let status = response.status();
            Error::handshake(
                status.as_u16(),
                status.canonical_reason().unwrap_or("handshake rejected"),
            )
        }
        other => Error::connect(other.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, updates: mpsc::Sender<WorkspaceInstance>) -> Result<Arc<dyn Link>> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::invalid_config(format!("token is not a valid header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(request).await.map_err(handshake_error)?;
        debug!(endpoint = %self.endpoint, status = %response.status(), "WebSocket handshake complete");
        Ok(Arc::new(WsLink::start(stream, updates, self.call_timeout)))
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

enum Outbound {
    Text(String),
    Close,
}

/// A live JSON-RPC link.
pub struct WsLink {
    outbound: mpsc::Sender<Outbound>,
    pending: Pending,
    next_id: AtomicU64,
    closed: watch::Receiver<bool>,
    call_timeout: Duration,
}

impl WsLink {
    /// Take over an established socket and start its driver task.
    pub fn start<S>(
        stream: WebSocketStream<S>,
        updates: mpsc::Sender<WorkspaceInstance>,
        call_timeout: Duration,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (closed_tx, closed) = watch::channel(false);
        let pending = Pending::default();
        tokio::spawn(drive(
            stream,
            outbound_rx,
            Arc::clone(&pending),
            updates,
            closed_tx,
        ));

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            call_timeout,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if self
            .outbound
            .send(Outbound::Text(request.to_string()))
            .await
            .is_err()
        {
            self.pending().remove(&id);
            return Err(Error::LinkClosed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::LinkClosed),
            Err(_) => {
                self.pending().remove(&id);
                Err(Error::timeout(method))
            }
        }
    }

    async fn call_for_string(&self, method: &str, params: Value) -> Result<String> {
        match self.call(method, params).await? {
            Value::String(value) => Ok(value),
            other => Err(Error::protocol(format!(
                "{method} returned {other} instead of a string"
            ))),
        }
    }
}

#[async_trait]
impl Link for WsLink {
    async fn send_heartbeat(&self, instance_id: &str, was_closed: bool) -> Result<()> {
        self.call(
            "sendHeartbeat",
            json!([{ "instanceId": instance_id, "wasClosed": was_closed }]),
        )
        .await
        .map(|_| ())
    }

    async fn get_owner_token(&self, workspace_id: &str) -> Result<String> {
        self.call_for_string("getOwnerToken", json!([workspace_id]))
            .await
    }

    async fn get_join_link(&self, instance_id: &str) -> Result<String> {
        self.call_for_string("getJoinLink", json!([instance_id])).await
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // Err means the driver is gone, which only happens after it closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        if self.outbound.send(Outbound::Close).await.is_err() {
            debug!("Link already closed");
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// A decoded server frame.
#[derive(Debug)]
enum Frame {
    Response { id: u64, outcome: Result<Value> },
    Update(WorkspaceInstance),
    Ignored(String),
}

fn parse_frame(text: &str) -> Result<Frame> {
    let frame: IncomingFrame = serde_json::from_str(text)?;

    match (frame.method, frame.id) {
        (Some(method), _) if method == INSTANCE_UPDATE => {
            let value = match frame.params {
                Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
                other => other,
            };
            WorkspaceInstance::from_value(value)
                .map(Frame::Update)
                .map_err(|e| Error::protocol(format!("bad instance update: {e}")))
        }
        (Some(method), _) => Ok(Frame::Ignored(method)),
        (None, Some(id)) => {
            let outcome = match frame.error {
                Some(error) => Err(Error::rpc(error.code, error.message)),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            Ok(Frame::Response { id, outcome })
        }
        (None, None) => Err(Error::protocol("frame is neither a call nor a response")),
    }
}

async fn dispatch(text: &str, pending: &Pending, updates: &mpsc::Sender<WorkspaceInstance>) {
    match parse_frame(text) {
        Ok(Frame::Response { id, outcome }) => {
            let waiter = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            match waiter {
                Some(waiter) => {
                    // The caller may have timed out in the meantime.
                    let _ = waiter.send(outcome);
                }
                None => debug!(id, "Response to an unknown call"),
            }
        }
        Ok(Frame::Update(instance)) => {
            if updates.send(instance).await.is_err() {
                debug!("No instance update listener");
            }
        }
        Ok(Frame::Ignored(method)) => debug!(method = %method, "Ignoring server call"),
        Err(e) => warn!(error = %e, "Malformed frame from server"),
    }
}

async fn drive<S>(
    stream: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    pending: Pending,
    updates: mpsc::Sender<WorkspaceInstance>,
    closed: watch::Sender<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut incoming) = stream.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(error = %e, "Cannot write to link");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "Close handshake failed");
                    }
                    break;
                }
            },
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), &pending, &updates).await,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Link closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Link read failed");
                    break;
                }
                None => break,
            },
        }
    }

    // Outstanding calls see their sender dropped and fail with LinkClosed.
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    closed.send_replace(true);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use warden_core::Phase;

    use super::*;

    #[test]
    fn test_link_address() {
        assert_eq!(link_address("https://example.com"), "wss://example.com");
        assert_eq!(link_address("http://example.com/"), "wss://example.com");
        assert_eq!(link_address("example.com"), "wss://example.com");
        assert_eq!(link_address("wss://a.b:8443"), "wss://a.b:8443");
    }

    #[test]
    fn test_connector_endpoint() {
        let connector = WsConnector::new("https://example.com").unwrap();
        assert_eq!(connector.endpoint().as_str(), "wss://example.com/api/v1");
        assert!(WsConnector::with_endpoint("https://example.com").is_err());
    }

    #[test]
    fn test_parse_response_frames() {
        match parse_frame(r#"{"jsonrpc":"2.0","id":3,"result":"tok"}"#).unwrap() {
            Frame::Response { id, outcome } => {
                assert_eq!(id, 3);
                assert_eq!(outcome.unwrap(), Value::String("tok".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }

        match parse_frame(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap() {
            Frame::Response { outcome, .. } => assert_eq!(outcome.unwrap(), Value::Null),
            other => panic!("unexpected {other:?}"),
        }

        match parse_frame(r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32001,"message":"denied"}}"#)
            .unwrap()
        {
            Frame::Response { outcome, .. } => {
                assert!(matches!(outcome, Err(Error::Rpc { code: -32001, .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_instance_update() {
        let text = r#"{"jsonrpc":"2.0","method":"workspaceInstanceUpdate","params":[
            {"id":"inst-1","workspaceId":"ws-1","status":{"phase":"running"}}
        ]}"#;
        match parse_frame(text).unwrap() {
            Frame::Update(instance) => {
                assert_eq!(instance.id, "inst-1");
                assert_eq!(instance.phase(), Phase::Running);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            parse_frame(r#"{"jsonrpc":"2.0","method":"somethingElse","params":[]}"#).unwrap(),
            Frame::Ignored(_)
        ));
        assert!(parse_frame(r#"{"jsonrpc":"2.0"}"#).is_err());
        assert!(parse_frame("not json").is_err());
    }
}
