//! Language model contract.
//!
//! The orchestrator drives any model that can take a system prompt, a
//! transcript, and a tool list, and answer with text and tool calls. The
//! provider integration lives outside this crate; [`ScriptedModel`] is a
//! deterministic implementation for tests and offline replay.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result type for model calls.
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors from the model collaborator.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model call failed: {0}")]
    Call(String),

    #[error("model returned malformed tool arguments: {0}")]
    BadArguments(String),
}

/// JSON-schema description of one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Message role in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One transcript message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, output: &Value) -> Self {
        Self {
            role: Role::Tool,
            content: Some(output.to_string()),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(name.into()),
        }
    }
}

/// One model step's input: per-phase system prompt, transcript, tools.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// One model step's output.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelTurn {
    /// A turn consisting of a single tool call.
    pub fn call(name: &str, arguments: Value) -> Self {
        Self {
            text: None,
            tool_calls: vec![ToolCall {
                id: format!("call-{name}"),
                name: name.to_string(),
                arguments,
            }],
        }
    }

    /// A text-only turn.
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Contract with the model provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn step(&self, request: ModelRequest) -> LlmResult<ModelTurn>;
}

/// A model that replays a fixed sequence of turns.
///
/// Each `step` pops the next turn; running out of turns is a call error.
/// Used by the integration tests and offline replay.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ModelTurn>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn step(&self, _request: ModelRequest) -> LlmResult<ModelTurn> {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| LlmError::Call("scripted model has no more turns".to_string()))
    }
}
