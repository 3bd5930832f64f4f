//! Device identity and bearer token handling
//!
//! The signing scheme is owned by the caller: the handshake only needs a
//! [`DeviceSigner`] that turns a server challenge into a signature string.
//! Bearer tokens are resolved from config, environment or a token file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};
use crate::protocol::{Challenge, DeviceAuth};

/// Environment variable consulted for the bearer token
pub const TOKEN_ENV: &str = "GATELINK_TOKEN";

/// Produces proof of possession of the device key
pub trait DeviceSigner: Send + Sync {
    /// Stable device identifier registered with the gateway
    fn device_id(&self) -> String;

    /// Public half of the device key, in the encoding the gateway expects
    fn public_key(&self) -> String;

    /// Sign the challenge nonce and timestamp
    fn sign(&self, challenge: &Challenge) -> Result<String>;
}

/// Build the `device` block of a connect request
pub fn device_auth(signer: &dyn DeviceSigner, challenge: &Challenge) -> Result<DeviceAuth> {
    let signature = signer.sign(challenge).map_err(|e| match e {
        GatewayError::Signing { .. } => e,
        other => GatewayError::Signing {
            message: other.to_string(),
        },
    })?;
    Ok(DeviceAuth {
        id: signer.device_id(),
        public_key: signer.public_key(),
        signature,
        signed_at: Utc::now().timestamp_millis(),
        nonce: challenge.nonce.clone(),
    })
}

/// Token as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredToken {
    pub token: String,
    pub saved_at: DateTime<Utc>,
}

/// File-backed bearer token storage
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<config_dir>/gatelink/token.json`
    pub fn at_default_path() -> Option<Self> {
        crate::config::get_config_dir().map(|dir| Self::new(dir.join("token.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token, if any
    pub fn load(&self) -> Result<Option<StoredToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let stored: StoredToken = serde_json::from_str(&content)?;
        if stored.token.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(stored))
    }

    pub fn save(&self, token: &str) -> Result<StoredToken> {
        let stored = StoredToken {
            token: token.to_string(),
            saved_at: Utc::now(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&stored)?)?;
        tracing::debug!(path = %self.path.display(), "saved gateway token");
        Ok(stored)
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolve the bearer token: explicit config value, then env, then file
pub fn resolve_token(configured: Option<&str>, store: Option<&TokenStore>) -> Result<Option<String>> {
    if let Some(token) = configured.filter(|t| !t.trim().is_empty()) {
        return Ok(Some(token.to_string()));
    }
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            return Ok(Some(token));
        }
    }
    match store {
        Some(store) => Ok(store.load()?.map(|s| s.token)),
        None => Ok(None),
    }
}
