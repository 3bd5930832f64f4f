//! Client SDK for agent gateways
//!
//! - [`transport`]: WebSocket channel with request multiplexing and push
//!   events, plus a REST fallback
//! - [`execution`]: run an agent request and collect its streamed answer
//! - [`resilience`]: circuit breaker, retry, rate limiting, deduplication
//! - [`client`]: one handle tying the above to a [`Config`]

pub mod client;
pub mod config;
pub mod error;
pub mod execution;
pub mod identity;
pub mod protocol;
pub mod resilience;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use client::GatewayClient;
pub use config::Config;
pub use error::{ErrorKind, GatewayError, Result, Retryable};
pub use execution::{AgentRequest, ExecutionCoordinator, ExecutionOutcome, ExecutionUpdate, Invoke};
pub use identity::{DeviceSigner, TokenStore};
pub use protocol::{Frame, PushEvent, PROTOCOL_VERSION};
pub use resilience::{
    CircuitBreaker, CircuitState, RateLimiter, RequestDeduplicator, ResiliencePolicy, ResilientInvoker,
    ResilientTransport, RetryPolicy,
};
pub use transport::{EventFilter, GatewayChannel, RestTransport, Subscription, Transport};
