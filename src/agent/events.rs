//! Streaming progress events.
//!
//! The transport collaborator consumes these over an `mpsc` channel.
//! Emission is best-effort: a closed or full receiver never fails the
//! request.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// One progress event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PhaseStarted { phase: String },
    StepStarted { step: u32 },
    ToolStarted { tool: String, input: Value },
    ToolFinished { tool: String, output: Value },
    TextDelta { delta: String },
    ReasoningDelta { delta: String },
    StepFinished { step: u32 },
    Error { message: String },
    Done,
}

/// Best-effort event emitter.
#[derive(Clone)]
pub struct EventSink {
    sender: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSink {
    pub fn new(sender: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub async fn emit(&self, event: AgentEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event).await;
        }
    }
}
