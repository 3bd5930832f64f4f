//! Test doubles: an in-process mock gateway and a scripted transport

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::error::{GatewayError, Result};
use crate::identity::DeviceSigner;
use crate::protocol::{Challenge, ConnectParams, ErrorShape, Frame, CHALLENGE_EVENT, CONNECT_METHOD, HELLO_OK};
use crate::transport::{EventFilter, Subscription, Transport, TransportCapabilities};

/// Signs challenges as `"{nonce}:{ts}"`
pub struct TestSigner;

impl DeviceSigner for TestSigner {
    fn device_id(&self) -> String {
        "test-device".to_string()
    }

    fn public_key(&self) -> String {
        "test-key".to_string()
    }

    fn sign(&self, challenge: &Challenge) -> Result<String> {
        Ok(format!("{}:{}", challenge.nonce, challenge.ts))
    }
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub protocol: u32,
    pub reject: Option<ErrorShape>,
    pub send_hello: bool,
    /// Leave `ok` out of the hello-ok response
    pub bare_hello: bool,
    /// Raw text frames sent before the challenge
    pub preamble: Vec<String>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            protocol: crate::protocol::PROTOCOL_VERSION,
            reject: None,
            send_hello: true,
            bare_hello: false,
            preamble: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub id: String,
    pub method: String,
    pub params: Value,
}

enum Command {
    Send(String),
    Disconnect,
}

/// Gateway on 127.0.0.1 that performs the handshake, then hands every
/// request to the test and sends whatever frames the test asks for
pub struct MockGateway {
    pub url: String,
    requests: mpsc::UnboundedReceiver<MockRequest>,
    commands: mpsc::UnboundedSender<Command>,
    connect_params: Arc<Mutex<Option<ConnectParams>>>,
}

impl MockGateway {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let connect_params = Arc::new(Mutex::new(None));

        let params_slot = Arc::clone(&connect_params);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                serve(ws, &options, &request_tx, &mut command_rx, &params_slot).await;
            }
        });

        Self {
            url,
            requests,
            commands,
            connect_params,
        }
    }

    /// Next request received after the handshake
    pub async fn next_request(&mut self) -> MockRequest {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("mock gateway stopped")
    }

    pub fn respond(&self, id: &str, payload: Value) {
        self.send_frame(Frame::ok(id, payload));
    }

    pub fn fail(&self, id: &str, error: ErrorShape) {
        self.send_frame(Frame::err(id, error));
    }

    pub fn emit(&self, event: &str, payload: Value) {
        self.send_frame(Frame::event(event, payload));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.commands.send(Command::Send(text.to_string()));
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn connect_params(&self) -> Option<ConnectParams> {
        self.connect_params.lock().clone()
    }

    fn send_frame(&self, frame: Frame) {
        let _ = self.commands.send(Command::Send(frame.encode().unwrap()));
    }
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    options: &MockOptions,
    requests: &mpsc::UnboundedSender<MockRequest>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    params_slot: &Mutex<Option<ConnectParams>>,
) {
    let (mut sink, mut stream) = ws.split();

    for text in &options.preamble {
        if sink.send(Message::Text(text.clone().into())).await.is_err() {
            return;
        }
    }

    let challenge = Frame::event(CHALLENGE_EVENT, json!({"nonce": "nonce-1", "ts": 1_700_000_000_000i64}));
    if sink.send(Message::Text(challenge.encode().unwrap().into())).await.is_err() {
        return;
    }

    // Handshake
    loop {
        let Some(Ok(msg)) = stream.next().await else {
            return;
        };
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(Frame::Request { id, method, params }) = Frame::decode(text.as_str()) else {
            continue;
        };
        if method != CONNECT_METHOD {
            continue;
        }
        *params_slot.lock() = serde_json::from_value(params).ok();
        let reply = match &options.reject {
            Some(shape) => Some(Frame::err(id, shape.clone())),
            None if options.send_hello => Some(Frame::ok(
                id,
                json!({
                    "type": HELLO_OK,
                    "protocol": options.protocol,
                    "server": {"version": "mock-1", "connId": "conn-1"},
                    "features": {"methods": ["chat.send"], "events": ["chat"]},
                }),
            )),
            None => None,
        };
        if let Some(reply) = reply {
            let mut text = reply.encode().unwrap();
            if options.bare_hello {
                let mut value: Value = serde_json::from_str(&text).unwrap();
                value.as_object_mut().unwrap().remove("ok");
                text = value.to_string();
            }
            let _ = sink.send(Message::Text(text.into())).await;
        }
        break;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(Frame::Request { id, method, params }) = Frame::decode(text.as_str()) {
                        let _ = requests.send(MockRequest { id, method, params });
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Disconnect) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            }
        }
    }
}

/// Request/response transport with scripted replies and no events
#[derive(Default)]
pub struct StaticTransport {
    replies: Mutex<VecDeque<Result<Value>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: Result<Value>) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn call(&self, method: &str, params: Value, _timeout: Option<Duration>) -> Result<Value> {
        self.calls.lock().push((method.to_string(), params));
        self.replies.lock().pop_front().unwrap_or_else(|| {
            Err(GatewayError::Internal {
                message: "no scripted reply".to_string(),
            })
        })
    }

    fn subscribe(&self, _filter: EventFilter) -> Result<Subscription> {
        Err(GatewayError::NotSupported {
            feature: "events".to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::request_only()
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
