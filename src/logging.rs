//! Logging setup
//!
//! Installs a `tracing` subscriber filtered by `GATELINK_LOG`, then
//! `RUST_LOG`, then a default directive.

use anyhow::{Context, Result};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directive
pub const LOG_ENV: &str = "GATELINK_LOG";

const DEFAULT_DIRECTIVE: &str = "gatelink=info,gatelink_core=info";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber with the default directive
pub fn init() -> Result<()> {
    init_with_default(DEFAULT_DIRECTIVE)
}

/// Install the global subscriber; later calls are no-ops
pub fn init_with_default(default_directive: &str) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let filter = build_filter(std::env::var(LOG_ENV).ok(), default_directive)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    let _ = INSTALLED.set(());
    tracing::debug!("logging initialized");
    Ok(())
}

fn build_filter(explicit: Option<String>, default_directive: &str) -> Result<EnvFilter> {
    if let Some(directive) = explicit.filter(|d| !d.trim().is_empty()) {
        return EnvFilter::try_new(&directive).with_context(|| format!("invalid {}: {}", LOG_ENV, directive));
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directive)
            .with_context(|| format!("invalid log directive: {}", default_directive)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_directive_wins() {
        let filter = build_filter(Some("gatelink_core=trace".to_string()), DEFAULT_DIRECTIVE).unwrap();
        assert!(filter.to_string().contains("gatelink_core=trace"));
    }

    #[test]
    fn test_invalid_directive_is_error() {
        assert!(build_filter(Some("gatelink=notalevel".to_string()), DEFAULT_DIRECTIVE).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        init().unwrap();
        init().unwrap();
    }
}
