//! WebSocket gateway channel
//!
//! One persistent connection carries many concurrent calls. Each request
//! gets a fresh id; a background reader matches responses back to the
//! waiting caller and fans push events out to subscribers.
//!
//! Connection lifecycle:
//! 1. open socket, wait for `connect.challenge`
//! 2. send `connect` with token and (optionally) a signed device proof
//! 3. validate `hello-ok`, then start the reader and writer tasks
//!
//! When the socket ends, every pending call fails with a closed error and
//! every subscription stream terminates.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{EventFilter, Subscription, Transport, TransportCapabilities};
use crate::config::GatewaySettings;
use crate::error::{GatewayError, Result};
use crate::identity::{device_auth, DeviceSigner};
use crate::protocol::{
    response_result, AuthInfo, Challenge, ClientInfo, ConnectParams, Features, Frame, HelloOk,
    PushEvent, ServerInfo, CHALLENGE_EVENT, CONNECT_METHOD, PROTOCOL_VERSION,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for a [`GatewayChannel`]
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub client: ClientInfo,
}

impl ChannelOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client: ClientInfo::default(),
        }
    }

    pub fn from_settings(url: impl Into<String>, settings: &GatewaySettings, token: Option<String>) -> Self {
        Self {
            token,
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
            ..Self::new(url)
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    generation: u64,
    server: ServerInfo,
    features: Features,
}

struct PendingRequest {
    method: String,
    deadline: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<PushEvent>,
}

/// Everything the reader and callers share, under one lock
#[derive(Default)]
struct Shared {
    connection: Option<Connection>,
    generation: u64,
    pending: HashMap<String, PendingRequest>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

pub struct GatewayChannel {
    options: ChannelOptions,
    signer: Option<Arc<dyn DeviceSigner>>,
    shared: Arc<Mutex<Shared>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl GatewayChannel {
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            options,
            signer: None,
            shared: Arc::new(Mutex::new(Shared::default())),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn DeviceSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn url(&self) -> &str {
        &self.options.url
    }

    /// Open the socket and complete the handshake
    pub async fn connect(&self) -> Result<HelloOk> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shared.lock().connection.is_some() {
            return Err(GatewayError::AlreadyConnected);
        }

        let (ws, hello) = match tokio::time::timeout(self.options.connect_timeout, self.handshake()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::Handshake {
                    reason: format!(
                        "no hello-ok within {}ms",
                        self.options.connect_timeout.as_millis()
                    ),
                })
            }
        };

        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            let generation = shared.generation;
            shared.connection = Some(Connection {
                outbound,
                cancel: cancel.clone(),
                generation,
                server: hello.server.clone(),
                features: hello.features.clone(),
            });
            generation
        };

        tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&self.shared), generation, cancel.clone()));
        tokio::spawn(read_loop(stream, Arc::clone(&self.shared), generation, cancel));

        tracing::info!(
            url = %self.options.url,
            protocol = hello.protocol,
            server_version = %hello.server.version,
            "connected to gateway"
        );
        Ok(hello)
    }

    async fn handshake(&self) -> Result<(WsStream, HelloOk)> {
        let (mut ws, _response) = connect_async(self.options.url.as_str()).await?;

        let challenge = loop {
            match next_text(&mut ws, "challenge").await? {
                Frame::Event { event, payload, .. } if event == CHALLENGE_EVENT => {
                    let challenge: Challenge =
                        serde_json::from_value(payload).map_err(|e| GatewayError::Handshake {
                            reason: format!("malformed challenge: {}", e),
                        })?;
                    break challenge;
                }
                other => tracing::debug!(?other, "ignoring frame before challenge"),
            }
        };

        let device = match &self.signer {
            Some(signer) => Some(device_auth(signer.as_ref(), &challenge)?),
            None => None,
        };
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: self.options.client.clone(),
            auth: AuthInfo {
                token: self.options.token.clone(),
            },
            device,
        };
        let (id, request) = Frame::request(CONNECT_METHOD, serde_json::to_value(&params)?);
        ws.send(Message::Text(request.encode()?.into())).await?;

        loop {
            match next_text(&mut ws, "hello-ok").await? {
                Frame::Response { id: rid, ok, payload, error } if rid == id => {
                    let payload = response_result(ok, payload, error).map_err(|shape| GatewayError::Handshake {
                        reason: format!("connect rejected: {}: {}", shape.code, shape.message),
                    })?;
                    let hello = HelloOk::from_payload(payload, PROTOCOL_VERSION, PROTOCOL_VERSION)?;
                    return Ok((ws, hello));
                }
                other => tracing::debug!(?other, "ignoring frame before hello-ok"),
            }
        }
    }

    /// Close the connection; idempotent
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let generation = match self.shared.lock().connection.as_ref() {
            Some(connection) => connection.generation,
            None => return Ok(()),
        };
        teardown(&self.shared, generation, "closed by client");
        tracing::info!(url = %self.options.url, "gateway connection closed");
        Ok(())
    }

    /// Send a request and wait for its response
    pub async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.options.request_timeout);
        let (id, frame) = Frame::request(method, params);
        let text = frame.encode()?;
        let (slot, response) = oneshot::channel();

        {
            let mut shared = self.shared.lock();
            let outbound = shared
                .connection
                .as_ref()
                .map(|c| c.outbound.clone())
                .ok_or(GatewayError::NotConnected)?;
            // Register before sending so a fast response always finds its slot
            shared.pending.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    deadline: Instant::now() + timeout,
                    slot,
                },
            );
            if outbound.send(Message::Text(text.into())).is_err() {
                shared.pending.remove(&id);
                return Err(GatewayError::closed("writer stopped"));
            }
        }

        let _guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            id: id.clone(),
        };
        tracing::trace!(%id, method, "request sent");

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::closed("connection dropped before response")),
            Err(_) => Err(GatewayError::CallTimeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }

    /// Register an event subscriber on the live connection
    pub fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        let mut shared = self.shared.lock();
        if shared.connection.is_none() {
            return Err(GatewayError::NotConnected);
        }
        shared.subscribers.retain(|sub| !sub.tx.is_closed());
        shared.next_subscriber += 1;
        let id = shared.next_subscriber;
        let (tx, rx) = mpsc::unbounded_channel();
        shared.subscribers.push(Subscriber { id, filter, tx });
        tracing::debug!(subscriber = id, "subscriber registered");
        Ok(Subscription::new(id, rx))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connection.is_some()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.lock().connection.as_ref().map(|c| c.server.clone())
    }

    pub fn features(&self) -> Option<Features> {
        self.shared.lock().connection.as_ref().map(|c| c.features.clone())
    }

    /// Calls waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Subscribers whose receiving end is still alive
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .lock()
            .subscribers
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl Transport for GatewayChannel {
    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        GatewayChannel::call(self, method, params, timeout).await
    }

    fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        GatewayChannel::subscribe(self, filter)
    }

    async fn close(&self) -> Result<()> {
        GatewayChannel::close(self).await
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::full()
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Removes a pending entry when the caller stops waiting
struct PendingGuard {
    shared: Arc<Mutex<Shared>>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(&self.id);
    }
}

/// Next text frame during the handshake
async fn next_text(ws: &mut WsStream, waiting_for: &str) -> Result<Frame> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                Ok(frame) => return Ok(frame),
                Err(e) => tracing::debug!(error = %e, waiting_for, "skipping undecodable handshake frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(GatewayError::Handshake {
                    reason: format!("socket closed while waiting for {}", waiting_for),
                })
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Mutex<Shared>>,
    generation: u64,
    cancel: CancellationToken,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!(error = %e, "gateway write failed");
                        // Tear down here so callers see the write error, not a client close
                        teardown(&shared, generation, &format!("write failed: {}", e));
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

async fn read_loop<S>(mut stream: S, shared: Arc<Mutex<Shared>>, generation: u64, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "closed by client".to_string(),
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch(&shared, text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!("gateway closed the socket: {}", frame.reason),
                        None => "gateway closed the socket".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "socket ended".to_string(),
            }
        }
    };
    teardown(&shared, generation, &reason);
}

fn dispatch(shared: &Mutex<Shared>, text: &str) {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed frame");
            return;
        }
    };

    match frame {
        Frame::Response { id, ok, payload, error } => {
            let pending = shared.lock().pending.remove(&id);
            let Some(pending) = pending else {
                tracing::debug!(%id, "dropping response for unknown request");
                return;
            };
            let result = response_result(ok, payload, error).map_err(|shape| shape.into_error(&pending.method));
            let _ = pending.slot.send(result);
        }
        Frame::Event { event, payload, seq } => {
            let event = PushEvent::new(event, payload, seq);
            let mut shared = shared.lock();
            // Dropped subscriptions go whether or not this event matches them
            shared.subscribers.retain(|sub| {
                !sub.tx.is_closed() && (!sub.filter.matches(&event.kind) || sub.tx.send(event.clone()).is_ok())
            });
        }
        Frame::Request { method, .. } => {
            tracing::debug!(method, "ignoring server-initiated request");
        }
    }
}

/// Drop the connection of `generation`, failing its pending calls
fn teardown(shared: &Mutex<Shared>, generation: u64, reason: &str) {
    let (connection, pending, subscribers) = {
        let mut shared = shared.lock();
        match &shared.connection {
            Some(c) if c.generation == generation => {}
            _ => return,
        }
        let connection = shared.connection.take();
        let pending: Vec<PendingRequest> = shared.pending.drain().map(|(_, p)| p).collect();
        let subscribers = std::mem::take(&mut shared.subscribers);
        (connection, pending, subscribers)
    };

    if let Some(connection) = connection {
        connection.cancel.cancel();
    }
    let now = Instant::now();
    for request in pending {
        tracing::debug!(
            method = %request.method,
            overdue = request.deadline <= now,
            "failing pending call"
        );
        let _ = request.slot.send(Err(GatewayError::closed(reason)));
    }
    let ids: Vec<u64> = subscribers.iter().map(|s| s.id).collect();
    tracing::debug!(?ids, reason, "connection torn down, closing subscriptions");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorShape;
    use crate::testing::{MockGateway, MockOptions, TestSigner};
    use serde_json::json;

    async fn connected(gateway: &MockGateway) -> Arc<GatewayChannel> {
        let channel = GatewayChannel::new(
            ChannelOptions::new(gateway.url.clone())
                .with_token("secret")
                .with_timeouts(Duration::from_secs(2), Duration::from_secs(2)),
        );
        channel.connect().await.unwrap();
        Arc::new(channel)
    }

    #[tokio::test]
    async fn test_handshake_sends_token_and_device_proof() {
        let gateway = MockGateway::start(MockOptions::default()).await;
        let channel = GatewayChannel::new(ChannelOptions::new(gateway.url.clone()).with_token("secret"))
            .with_signer(Arc::new(TestSigner));

        let hello = channel.connect().await.unwrap();
        assert_eq!(hello.protocol, PROTOCOL_VERSION);
        assert!(channel.is_connected());
        assert_eq!(channel.server_info().unwrap().version, "mock-1");

        let params = gateway.connect_params().unwrap();
        assert_eq!(params.auth.token.as_deref(), Some("secret"));
        let device = params.device.unwrap();
        assert_eq!(device.nonce, "nonce-1");
        assert_eq!(device.signature, "nonce-1:1700000000000");
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;
        assert!(matches!(channel.connect().await, Err(GatewayError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn test_protocol_mismatch_fails_handshake() {
        let gateway = MockGateway::start(MockOptions {
            protocol: 2,
            ..MockOptions::default()
        })
        .await;
        let channel = GatewayChannel::new(ChannelOptions::new(gateway.url.clone()));
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolMismatch { server: 2, .. }));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_connect_fails_handshake() {
        let gateway = MockGateway::start(MockOptions {
            reject: Some(ErrorShape::new("UNAUTHORIZED", "bad token")),
            ..MockOptions::default()
        })
        .await;
        let channel = GatewayChannel::new(ChannelOptions::new(gateway.url.clone()));
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Handshake { ref reason } if reason.contains("bad token")));
    }

    #[tokio::test]
    async fn test_handshake_skips_undecodable_frames_and_bare_hello() {
        let gateway = MockGateway::start(MockOptions {
            preamble: vec![r#"{"type":"presence","who":"x"}"#.to_string(), "{not json".to_string()],
            bare_hello: true,
            ..MockOptions::default()
        })
        .await;
        let channel = GatewayChannel::new(
            ChannelOptions::new(gateway.url.clone()).with_timeouts(Duration::from_secs(2), Duration::from_secs(2)),
        );
        let hello = channel.connect().await.unwrap();
        assert_eq!(hello.server.version, "mock-1");
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_missing_hello_times_out() {
        let gateway = MockGateway::start(MockOptions {
            send_hello: false,
            ..MockOptions::default()
        })
        .await;
        let channel = GatewayChannel::new(
            ChannelOptions::new(gateway.url.clone())
                .with_timeouts(Duration::from_millis(200), Duration::from_secs(1)),
        );
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_call_before_connect() {
        let channel = GatewayChannel::new(ChannelOptions::new("ws://127.0.0.1:9"));
        let err = channel.call("health", Value::Null, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
        assert!(matches!(channel.subscribe(EventFilter::all()), Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_out_of_order() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        let first = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("sessions.list", json!({"n": 1}), None).await }
        });
        let req1 = gateway.next_request().await;
        let second = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("sessions.list", json!({"n": 2}), None).await }
        });
        let req2 = gateway.next_request().await;
        assert_ne!(req1.id, req2.id);
        assert_eq!(channel.pending_count(), 2);

        gateway.respond(&req2.id, json!({"answer": 2}));
        gateway.respond(&req1.id, json!({"answer": 1}));

        assert_eq!(first.await.unwrap().unwrap(), json!({"answer": 1}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"answer": 2}));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_mapped() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("cron.list", Value::Null, None).await }
        });
        let req = gateway.next_request().await;
        gateway.fail(&req.id, ErrorShape::new("METHOD_NOT_FOUND", "no such method"));

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::UnknownMethod { ref method } if method == "cron.list"));
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_and_channel_stays_usable() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        let err = channel
            .call("status", Value::Null, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CallTimeout { ref method, .. } if method == "status"));
        assert_eq!(channel.pending_count(), 0);

        // Late response for the abandoned id is dropped
        let stale = gateway.next_request().await;
        gateway.respond(&stale.id, json!("late"));

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("status", Value::Null, None).await }
        });
        let req = gateway.next_request().await;
        gateway.respond(&req.id, json!({"ok": true}));
        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_unknown_response_and_garbage_are_ignored() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        gateway.respond("no-such-id", json!(1));
        gateway.send_raw("{not json");

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("health", Value::Null, None).await }
        });
        let req = gateway.next_request().await;
        gateway.respond(&req.id, json!("healthy"));
        assert_eq!(call.await.unwrap().unwrap(), json!("healthy"));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_events_fan_out_to_matching_subscribers() {
        let gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        let mut everything = channel.subscribe(EventFilter::all()).unwrap();
        let mut chat_only = channel.subscribe(EventFilter::kinds(["chat"])).unwrap();
        assert_eq!(channel.subscriber_count(), 2);

        gateway.emit("tick", json!({"ts": 1}));
        gateway.emit("chat", json!({"runId": "r1", "state": "delta", "delta": "a"}));
        gateway.emit("chat", json!({"runId": "r1", "state": "delta", "delta": "b"}));

        assert_eq!(everything.recv().await.unwrap().kind, "tick");
        assert_eq!(everything.recv().await.unwrap().payload["delta"], "a");
        assert_eq!(everything.recv().await.unwrap().payload["delta"], "b");

        assert_eq!(chat_only.recv().await.unwrap().payload["delta"], "a");
        assert_eq!(chat_only.recv().await.unwrap().payload["delta"], "b");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        let dropped = channel.subscribe(EventFilter::all()).unwrap();
        let mut kept = channel.subscribe(EventFilter::all()).unwrap();
        drop(dropped);
        assert_eq!(channel.subscriber_count(), 1);

        gateway.emit("tick", json!({}));
        assert_eq!(kept.recv().await.unwrap().kind, "tick");
        assert_eq!(channel.shared.lock().subscribers.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_filtered_subscribers_do_not_accumulate() {
        let gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        for _ in 0..100 {
            drop(channel.subscribe(EventFilter::kinds(["never"])).unwrap());
        }
        let mut ticks = channel.subscribe(EventFilter::kinds(["tick"])).unwrap();
        assert_eq!(channel.shared.lock().subscribers.len(), 1);

        let idle = channel.subscribe(EventFilter::kinds(["never"])).unwrap();
        drop(idle);
        gateway.emit("tick", json!({}));
        assert_eq!(ticks.recv().await.unwrap().kind, "tick");
        assert_eq!(channel.shared.lock().subscribers.len(), 1);
    }

    #[tokio::test]
    async fn test_response_without_ok_flag_resolves_call() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("health", Value::Null, Some(Duration::from_millis(500))).await }
        });
        let req = gateway.next_request().await;
        gateway.send_raw(&format!(r#"{{"type":"res","id":"{}","payload":{{"a":1}}}}"#, req.id));
        assert_eq!(call.await.unwrap().unwrap(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_to_pending_calls() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (slot, response) = oneshot::channel();
        {
            let mut guard = shared.lock();
            guard.generation = 1;
            guard.connection = Some(Connection {
                outbound: outbound.clone(),
                cancel: cancel.clone(),
                generation: 1,
                server: ServerInfo::default(),
                features: Features::default(),
            });
            guard.pending.insert(
                "1".to_string(),
                PendingRequest {
                    method: "health".to_string(),
                    deadline: Instant::now() + Duration::from_secs(5),
                    slot,
                },
            );
        }

        let broken = Box::pin(futures_util::sink::unfold((), |_, _msg: Message| async {
            Err::<(), _>("broken pipe")
        }));
        let writer = tokio::spawn(write_loop(broken, outbound_rx, Arc::clone(&shared), 1, cancel.clone()));
        outbound.send(Message::Text("{}".into())).unwrap();
        writer.await.unwrap();

        let err = response.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed { ref reason } if reason.contains("broken pipe")));
        assert!(cancel.is_cancelled());
        assert!(shared.lock().connection.is_none());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_ends_subscriptions() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;
        let mut events = channel.subscribe(EventFilter::all()).unwrap();

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("agents.list", Value::Null, None).await }
        });
        gateway.next_request().await;

        channel.close().await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed { .. }));
        assert!(events.recv().await.is_none());
        assert!(!channel.is_connected());
        assert_eq!(channel.pending_count(), 0);

        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_disconnect_fails_pending() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;
        let mut events = channel.subscribe(EventFilter::all()).unwrap();

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("models.list", Value::Null, None).await }
        });
        gateway.next_request().await;
        gateway.disconnect();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed { .. }));
        assert!(events.recv().await.is_none());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let channel = connected(&gateway).await;
        channel.close().await.unwrap();

        channel.connect().await.unwrap();
        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.call("health", Value::Null, None).await }
        });
        let req = gateway.next_request().await;
        gateway.respond(&req.id, json!("ok"));
        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    }
}
