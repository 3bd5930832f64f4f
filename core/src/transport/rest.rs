//! REST fallback transport
//!
//! Maps gateway method names onto HTTP routes. Only request/response is
//! available over HTTP, so subscriptions are rejected.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;

use super::{EventFilter, Subscription, Transport, TransportCapabilities};
use crate::error::{GatewayError, Result};
use crate::protocol::ErrorShape;

/// Method name, HTTP verb, path template
const ROUTES: &[(&str, &str, &str)] = &[
    ("health", "GET", "/health"),
    ("status", "GET", "/api/status"),
    ("agents.list", "GET", "/api/agents"),
    ("models.list", "GET", "/api/models"),
    ("sessions.list", "GET", "/api/sessions"),
    ("sessions.history", "GET", "/api/sessions/{sessionKey}/history"),
    ("sessions.reset", "POST", "/api/sessions/{sessionKey}/reset"),
    ("chat.send", "POST", "/api/chat"),
    ("agent", "POST", "/api/agent"),
    ("config.get", "GET", "/api/config"),
    ("cron.list", "GET", "/api/cron"),
];

/// Look up the HTTP route for a gateway method
pub fn route_for(method: &str) -> Option<(Method, &'static str)> {
    ROUTES.iter().find(|(name, _, _)| *name == method).map(|(_, verb, path)| {
        let verb = if *verb == "POST" { Method::POST } else { Method::GET };
        (verb, *path)
    })
}

pub struct RestTransport {
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    http: Client,
}

impl RestTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("gatelink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            request_timeout,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let (verb, template) = route_for(method).ok_or_else(|| GatewayError::UnknownMethod {
            method: method.to_string(),
        })?;
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(GatewayError::malformed(format!(
                    "params for {} must be an object, got {}",
                    method, other
                )))
            }
        };
        let path = fill_path(template, &mut params, method)?;
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.http.request(verb.clone(), &url).timeout(timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request = if verb == Method::GET {
            let query: Vec<(String, String)> = params
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect();
            request.query(&query)
        } else {
            request.json(&Value::Object(params))
        };

        tracing::debug!(method, %url, "REST call");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::CallTimeout {
                    method: method.to_string(),
                    timeout,
                }
            } else {
                GatewayError::ConnectionFailed {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.map_err(|e| GatewayError::ConnectionFailed {
            message: e.to_string(),
        })?;

        if status.is_success() {
            return unwrap_envelope(method, &body);
        }
        Err(status_error(method, status, retry_after, body))
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        self.send(method, params, timeout.unwrap_or(self.request_timeout)).await
    }

    fn subscribe(&self, _filter: EventFilter) -> Result<Subscription> {
        Err(GatewayError::NotSupported {
            feature: "push events over REST".to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::request_only()
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}

/// Substitute `{name}` segments from params, removing the used keys
fn fill_path(template: &str, params: &mut Map<String, Value>, method: &str) -> Result<String> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let value = match params.remove(name) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(GatewayError::malformed(format!(
                    "{} requires a `{}` parameter",
                    method, name
                )))
            }
        };
        path.push_str(&rest[..start]);
        path.push_str(&urlencoding::encode(&value));
        rest = &rest[start + len + 1..];
    }
    path.push_str(rest);
    Ok(path)
}

/// Success bodies may be bare JSON, plain text or an `{ok, payload}` envelope
fn unwrap_envelope(method: &str, body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return Ok(Value::String(body.to_string())),
    };
    match value.get("ok").and_then(Value::as_bool) {
        Some(false) => {
            let shape = value
                .get("error")
                .cloned()
                .and_then(|e| serde_json::from_value::<ErrorShape>(e).ok())
                .unwrap_or_else(|| ErrorShape::new("UNKNOWN", "request failed"));
            Err(shape.into_error(method))
        }
        Some(true) if value.get("payload").is_some() => Ok(value["payload"].clone()),
        _ => Ok(value),
    }
}

fn status_error(method: &str, status: StatusCode, retry_after: Option<Duration>, body: String) -> GatewayError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized { message: body },
        StatusCode::NOT_FOUND => GatewayError::UnknownMethod {
            method: method.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited { retry_after },
        s if s.is_server_error() => GatewayError::Unavailable {
            message: format!("{}: {}", s, body),
        },
        s => GatewayError::Remote {
            code: s.as_u16().to_string(),
            message: body,
            retryable: Some(false),
            retry_after,
        },
    }
}
