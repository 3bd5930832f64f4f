//! Gateway client
//!
//! Opens the best available transport for a [`Config`], wraps it in the
//! configured resilience layers and exposes calls, subscriptions and agent
//! execution behind one handle.

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::execution::{AgentRequest, ExecutionCoordinator, ExecutionOutcome, ExecutionUpdate, Invoke};
use crate::identity::{resolve_token, DeviceSigner, TokenStore};
use crate::resilience::{ResiliencePolicy, ResilientTransport};
use crate::transport::{
    ChannelOptions, EventFilter, GatewayChannel, RestTransport, Subscription, Transport,
};

pub struct GatewayClient {
    config: Config,
    transport: Arc<dyn Transport>,
    coordinator: ExecutionCoordinator,
    policy: ResiliencePolicy,
}

impl GatewayClient {
    /// Connect using `config`, preferring the WebSocket gateway and falling
    /// back to REST when the socket cannot be opened
    pub async fn connect(config: Config, signer: Option<Arc<dyn DeviceSigner>>) -> Result<Self> {
        config.validate()?;
        let store = match &config.gateway.token_path {
            Some(path) => Some(TokenStore::new(path.clone())),
            None => TokenStore::at_default_path(),
        };
        let token = resolve_token(config.gateway.token.as_deref(), store.as_ref())?;
        let transport = open_transport(&config, token, signer).await?;
        Ok(Self::with_transport(config, transport))
    }

    /// Build a client around an already-open transport
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let policy = ResiliencePolicy::from_settings(&config.resilience);
        let transport: Arc<dyn Transport> = if policy.is_empty() {
            transport
        } else {
            Arc::new(ResilientTransport::new(transport, policy.clone()))
        };
        let coordinator = ExecutionCoordinator::new(Arc::clone(&transport), &config.execution);
        Self {
            config,
            transport,
            coordinator,
            policy,
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.transport.call(method, params, None).await
    }

    pub async fn call_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.transport.call(method, params, Some(timeout)).await
    }

    pub fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        self.transport.subscribe(filter)
    }

    pub async fn execute(&self, request: AgentRequest) -> Result<ExecutionOutcome> {
        self.coordinator.execute(request).await
    }

    pub fn execute_stream(&self, request: AgentRequest) -> impl Stream<Item = Result<ExecutionUpdate>> + Send + 'static {
        self.coordinator.execute_stream(request)
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    /// Whether push events (and streamed execution) are available
    pub fn supports_events(&self) -> bool {
        self.transport.capabilities().supports_events
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl Invoke for GatewayClient {
    async fn invoke(&self, request: AgentRequest) -> Result<ExecutionOutcome> {
        self.execute(request).await
    }
}

async fn open_transport(
    config: &Config,
    token: Option<String>,
    signer: Option<Arc<dyn DeviceSigner>>,
) -> Result<Arc<dyn Transport>> {
    let gateway = &config.gateway;
    let mut socket_error = None;

    if let Some(url) = &gateway.url {
        let mut channel = GatewayChannel::new(ChannelOptions::from_settings(url, gateway, token.clone()));
        if let Some(signer) = signer {
            channel = channel.with_signer(signer);
        }
        match channel.connect().await {
            Ok(_) => return Ok(Arc::new(channel)),
            // A gateway that answered and refused us is not masked by REST
            Err(e) if !is_unreachable(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "websocket connect failed");
                socket_error = Some(e);
            }
        }
    }

    if let Some(rest_url) = &gateway.rest_url {
        let rest = RestTransport::new(rest_url.clone(), token, gateway.request_timeout())?;
        tracing::info!(url = %rest_url, "using REST transport, push events unavailable");
        return Ok(Arc::new(rest));
    }

    Err(match socket_error {
        Some(e) => GatewayError::config(format!("no usable transport: websocket failed ({}) and no rest_url is set", e)),
        None => GatewayError::config("no usable transport configured"),
    })
}

/// Socket-level failures that justify trying the REST fallback
fn is_unreachable(error: &GatewayError) -> bool {
    matches!(
        error,
        GatewayError::ConnectionFailed { .. } | GatewayError::ConnectionClosed { .. } | GatewayError::Io(_)
    )
}
