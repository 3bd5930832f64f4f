//! Transport trait - pluggable gateway connection
//!
//! The transport is the boundary between the client and the gateway.
//! Implementations:
//! - [`GatewayChannel`]: persistent WebSocket, multiplexed calls plus push events
//! - [`RestTransport`]: stateless HTTP fallback, calls only
//!
//! Resilience wrappers implement the same trait, so they can be stacked
//! without the caller noticing.

pub mod rest;
pub mod websocket;

pub use rest::RestTransport;
pub use websocket::{ChannelOptions, GatewayChannel};

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::error::Result;
use crate::protocol::PushEvent;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Invoke a remote method and wait for its result
    ///
    /// `timeout` falls back to the transport's configured request timeout.
    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value>;

    /// Register for push events matching `filter`
    ///
    /// Events arrive in receive order. The subscription ends when the
    /// connection closes.
    fn subscribe(&self, filter: EventFilter) -> Result<Subscription>;

    /// Close the transport; pending calls fail with a closed error
    async fn close(&self) -> Result<()>;

    fn capabilities(&self) -> TransportCapabilities;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Capabilities of a transport implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Delivers server-initiated events
    pub supports_events: bool,

    /// Many calls may be in flight on one connection
    pub multiplexed: bool,
}

impl TransportCapabilities {
    /// Full-featured transport
    pub fn full() -> Self {
        Self {
            supports_events: true,
            multiplexed: true,
        }
    }

    /// Request/response only
    pub fn request_only() -> Self {
        Self {
            supports_events: false,
            multiplexed: false,
        }
    }
}

/// Selects which push events a subscriber receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Option<HashSet<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self { kinds: None }
    }

    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: Some(kinds.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, kind: &str) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(kind),
            None => true,
        }
    }
}

/// Receiving end of an event subscription
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    events: UnboundedReceiverStream<PushEvent>,
}

impl Subscription {
    pub(crate) fn new(id: u64, rx: mpsc::UnboundedReceiver<PushEvent>) -> Self {
        Self {
            id,
            events: UnboundedReceiverStream::new(rx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.events.next().await
    }
}

impl Stream for Subscription {
    type Item = PushEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}
