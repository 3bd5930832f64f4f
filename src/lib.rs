//! `gatelink` - client SDK for agent gateways
//!
//! Re-exports the core library and adds process-level setup such as
//! logging. Typical use:
//!
//! ```no_run
//! use gatelink::{AgentRequest, Config, GatewayClient};
//!
//! # async fn run() -> gatelink::Result<()> {
//! gatelink::logging::init().ok();
//! let client = GatewayClient::connect(Config::load_or_default(), None).await?;
//! let outcome = client.execute(AgentRequest::new("status report please")).await?;
//! println!("{}", outcome.content);
//! client.close().await
//! # }
//! ```

pub mod logging;

pub use gatelink_core::*;
