//! Agent execution
//!
//! Starting a run is a plain call that only returns a run id; progress and
//! the final answer arrive later as `chat` events tagged with that id. The
//! coordinator subscribes before sending so no event can slip past, then
//! folds the events for its run into an [`ExecutionOutcome`].
//!
//! Transports without events return the answer in the call reply itself.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::config::ExecutionSettings;
use crate::error::{GatewayError, Result};
use crate::protocol::PushEvent;
use crate::transport::{EventFilter, Subscription, Transport};

/// One agent invocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Lets the gateway drop replays of the same invocation
    pub idempotency_key: String,
    /// Overrides the configured deadline
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_key: None,
            agent_id: None,
            thinking: None,
            idempotency_key: Uuid::new_v4().to_string(),
            deadline: None,
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_thinking(mut self, level: impl Into<String>) -> Self {
        self.thinking = Some(level.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub run_id: Option<String>,
    /// Final answer text
    pub content: String,
    /// Payload of the event (or reply) that completed the run
    pub payload: Value,
    /// Events consumed for this run
    pub events: usize,
}

impl ExecutionOutcome {
    fn from_reply(reply: Value) -> Self {
        let content = extract_text(&reply).unwrap_or_else(|| match &reply {
            Value::Null => String::new(),
            other => other.to_string(),
        });
        Self {
            run_id: run_id_of(&reply),
            content,
            payload: reply,
            events: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionUpdate {
    Started { run_id: Option<String> },
    Delta { run_id: Option<String>, text: String },
    Completed(ExecutionOutcome),
}

/// Anything that can run an agent request to completion
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<ExecutionOutcome>;
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    transport: Arc<dyn Transport>,
    method: String,
    deadline: Duration,
    filter: EventFilter,
}

impl ExecutionCoordinator {
    pub fn new(transport: Arc<dyn Transport>, settings: &ExecutionSettings) -> Self {
        Self {
            transport,
            method: settings.method.clone(),
            deadline: settings.deadline(),
            filter: EventFilter::kinds(settings.event_kinds.iter().cloned()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run to completion and return the final outcome
    pub async fn execute(&self, request: AgentRequest) -> Result<ExecutionOutcome> {
        let updates = self.execute_stream(request);
        futures::pin_mut!(updates);
        while let Some(update) = updates.next().await {
            if let ExecutionUpdate::Completed(outcome) = update? {
                return Ok(outcome);
            }
        }
        Err(GatewayError::Internal {
            message: "execution ended without an outcome".to_string(),
        })
    }

    /// Run and yield progress as it arrives
    ///
    /// The stream ends after `Completed` or the first error.
    pub fn execute_stream(&self, request: AgentRequest) -> impl Stream<Item = Result<ExecutionUpdate>> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let method = self.method.clone();
        let filter = self.filter.clone();
        let budget = request.deadline.unwrap_or(self.deadline);

        try_stream! {
            let deadline = Instant::now() + budget;
            let params = request.params()?;

            if transport.capabilities().supports_events {
                let mut events = transport.subscribe(filter)?;
                let reply = call_until(&*transport, &method, params, deadline, budget).await?;
                let run_id = run_id_of(&reply);
                tracing::debug!(run_id = ?run_id, "agent run started");
                yield ExecutionUpdate::Started { run_id: run_id.clone() };

                let mut content = String::new();
                let mut seen = 0usize;
                let outcome = loop {
                    let event = next_event(&mut events, deadline, budget, run_id.as_deref()).await?;
                    if !same_run(run_id.as_deref(), event.run_id.as_deref()) {
                        tracing::trace!(event_run = ?event.run_id, "ignoring event for another run");
                        continue;
                    }
                    seen += 1;
                    match RunState::of(&event.payload) {
                        RunState::Delta => {
                            if let Some(text) = event.payload.get("delta").and_then(Value::as_str) {
                                content.push_str(text);
                                yield ExecutionUpdate::Delta {
                                    run_id: run_id.clone(),
                                    text: text.to_string(),
                                };
                            }
                        }
                        RunState::Final => {
                            let text = event
                                .payload
                                .get("message")
                                .and_then(extract_text)
                                .filter(|t| !t.is_empty())
                                .unwrap_or_else(|| std::mem::take(&mut content));
                            break ExecutionOutcome {
                                run_id: event.run_id.clone().or_else(|| run_id.clone()),
                                content: text,
                                payload: event.payload,
                                events: seen,
                            };
                        }
                        RunState::Failed => {
                            run_failed(&event, run_id.as_deref())?;
                        }
                        RunState::Other => {}
                    }
                };
                tracing::debug!(run_id = ?outcome.run_id, events = outcome.events, "agent run finished");
                yield ExecutionUpdate::Completed(outcome);
            } else {
                let reply = call_until(&*transport, &method, params, deadline, budget).await?;
                let outcome = ExecutionOutcome::from_reply(reply);
                yield ExecutionUpdate::Started { run_id: outcome.run_id.clone() };
                yield ExecutionUpdate::Completed(outcome);
            }
        }
    }
}

#[async_trait]
impl Invoke for ExecutionCoordinator {
    async fn invoke(&self, request: AgentRequest) -> Result<ExecutionOutcome> {
        self.execute(request).await
    }
}

enum RunState {
    Delta,
    Final,
    Failed,
    Other,
}

impl RunState {
    fn of(payload: &Value) -> Self {
        match payload.get("state").and_then(Value::as_str) {
            Some("delta") => RunState::Delta,
            Some("final") => RunState::Final,
            Some("error") | Some("aborted") => RunState::Failed,
            _ => RunState::Other,
        }
    }
}

async fn call_until(
    transport: &dyn Transport,
    method: &str,
    params: Value,
    deadline: Instant,
    budget: Duration,
) -> Result<Value> {
    match timeout_at(deadline, transport.call(method, params, None)).await {
        Ok(reply) => reply,
        Err(_) => Err(GatewayError::ExecutionTimeout {
            run_id: None,
            deadline: budget,
        }),
    }
}

async fn next_event(
    events: &mut Subscription,
    deadline: Instant,
    budget: Duration,
    run_id: Option<&str>,
) -> Result<PushEvent> {
    match timeout_at(deadline, events.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(GatewayError::closed("event stream ended before the run finished")),
        Err(_) => Err(GatewayError::ExecutionTimeout {
            run_id: run_id.map(str::to_string),
            deadline: budget,
        }),
    }
}

fn run_failed(event: &PushEvent, run_id: Option<&str>) -> Result<()> {
    let state = event.payload.get("state").and_then(Value::as_str).unwrap_or("error");
    let message = event
        .payload
        .get("errorMessage")
        .or_else(|| event.payload.get("error"))
        .and_then(extract_text)
        .unwrap_or_else(|| format!("run {}", state));
    Err(GatewayError::Execution {
        run_id: event.run_id.clone().or_else(|| run_id.map(str::to_string)),
        message,
    })
}

/// Events without a run id are accepted; tagged events must match
fn same_run(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    }
}

fn run_id_of(reply: &Value) -> Option<String> {
    reply
        .get("runId")
        .or_else(|| reply.get("run_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Text from a string, a `{text}`/`{content}` object, or a content-block array
fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let text: String = blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => block.get("text").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect();
            Some(text)
        }
        Value::Object(_) => ["text", "content", "message"]
            .iter()
            .find_map(|key| value.get(*key))
            .and_then(extract_text),
        _ => None,
    }
}
