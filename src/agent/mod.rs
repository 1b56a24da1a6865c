//! The phase orchestrator: a state machine driving an LLM tool-calling
//! loop through Planning, Building, Execution, and Reporting.
//!
//! Each phase exposes its own system prompt and tool allow-list. The
//! machine advances when a step's tool results contain the phase's
//! terminal tool; `finalize_no_data` and `clarify_intent` exit the loop
//! early. A hard step ceiling bounds runaway tool use.

pub mod events;
pub mod llm;
pub mod phase;
pub mod report;
pub mod tools;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

pub use events::{AgentEvent, EventSink};
pub use llm::{
    ChatMessage, LanguageModel, LlmError, ModelRequest, ModelTurn, Role, ScriptedModel, ToolCall,
    ToolDefinition,
};
pub use phase::Phase;
pub use report::{Narrative, ResultArtifact, SanityReport};

use crate::config::Settings;
use crate::exec::{ExecutionGuard, ExecutionResult};
use crate::planner::plan::{FinalizedPlan, PlanError};
use crate::semantic::{Registry, SemanticError, SemanticStore};
use crate::sql::render::{RenderedSql, RenderError};

/// Errors that terminate a request.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Semantic(#[from] SemanticError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("step limit of {0} reached")]
    StepLimit(u32),
}

/// What execution produced, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub attempted_sql: Option<String>,
    pub repaired: bool,
    pub repair_reason: Option<String>,
}

/// Mutable per-request state shared by the tools.
#[derive(Default)]
pub struct SessionState {
    pub registry: Registry,
    pub plan: Option<FinalizedPlan>,
    pub rendered: Option<RenderedSql>,
    pub validated: bool,
    pub execution: Option<ExecutionSummary>,
    pub artifact: Option<ResultArtifact>,
    pub narrative: Option<Narrative>,
    pub no_data_answer: Option<String>,
    pub clarification: Option<String>,
}

/// Everything a tool needs: the store, the guard, settings, and the
/// request state.
pub struct ToolContext {
    pub store: Arc<SemanticStore>,
    pub guard: Arc<ExecutionGuard>,
    pub settings: Arc<Settings>,
    state: Mutex<SessionState>,
}

impl ToolContext {
    pub fn new(
        store: Arc<SemanticStore>,
        guard: Arc<ExecutionGuard>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            guard,
            settings,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Lock the request state. Held only for synchronous bookkeeping;
    /// never across an await point.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The final deliverable of a completed request.
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub narrative: Option<Narrative>,
    pub artifact: Option<ResultArtifact>,
    pub execution: Option<ExecutionSummary>,
    pub sql: Option<String>,
}

/// How a request ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    /// The full pipeline ran; Reporting produced the deliverable.
    Report(FinalReport),
    /// Answered directly without touching the warehouse.
    NoData { answer: String },
    /// Paused to ask the user a clarifying question.
    Clarification { question: String },
}

/// One request's driver: owns the phase machine and the tool loop.
pub struct AgentSession {
    ctx: Arc<ToolContext>,
    model: Arc<dyn LanguageModel>,
    events: EventSink,
    max_steps: u32,
    session_id: Uuid,
}

impl AgentSession {
    pub fn new(
        store: Arc<SemanticStore>,
        guard: Arc<ExecutionGuard>,
        settings: Arc<Settings>,
        model: Arc<dyn LanguageModel>,
        events: EventSink,
    ) -> Self {
        let max_steps = settings.agent.max_steps;
        Self {
            ctx: Arc::new(ToolContext::new(store, guard, settings)),
            model,
            events,
            max_steps,
            session_id: Uuid::new_v4(),
        }
    }

    /// The shared tool context, mainly for inspection in tests.
    pub fn context(&self) -> &Arc<ToolContext> {
        &self.ctx
    }

    /// Run one request to completion.
    pub async fn run(&self, question: &str) -> Result<AgentOutcome, AgentError> {
        let mut phase = Phase::Planning;
        let mut messages = vec![ChatMessage::user(question)];

        info!(session = %self.session_id, "request started");
        self.events
            .emit(AgentEvent::PhaseStarted {
                phase: phase.name().to_string(),
            })
            .await;

        for step in 1..=self.max_steps {
            self.events.emit(AgentEvent::StepStarted { step }).await;

            let request = ModelRequest {
                system: phase.system_prompt().to_string(),
                messages: messages.clone(),
                tools: tools::definitions(phase),
            };
            let turn = match self.model.step(request).await {
                Ok(turn) => turn,
                Err(e) => {
                    self.events
                        .emit(AgentEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return Err(e.into());
                }
            };

            if let Some(text) = &turn.text {
                self.events
                    .emit(AgentEvent::TextDelta {
                        delta: text.clone(),
                    })
                    .await;
                messages.push(ChatMessage::assistant(text.clone()));
            }

            if turn.tool_calls.is_empty() {
                // The machine only advances on tool results; nudge once
                // per step, bounded by the ceiling.
                messages.push(ChatMessage::user(
                    "Continue by calling one of the available tools.",
                ));
                self.events.emit(AgentEvent::StepFinished { step }).await;
                continue;
            }

            let mut fired: Vec<String> = Vec::new();
            for call in &turn.tool_calls {
                self.events
                    .emit(AgentEvent::ToolStarted {
                        tool: call.name.clone(),
                        input: call.arguments.clone(),
                    })
                    .await;

                let output = if phase.allows(&call.name) {
                    match tools::dispatch(&self.ctx, &call.name, call.arguments.clone()).await {
                        Ok(output) => output,
                        Err(e) => {
                            self.events
                                .emit(AgentEvent::Error {
                                    message: e.to_string(),
                                })
                                .await;
                            return Err(e);
                        }
                    }
                } else {
                    warn!(tool = %call.name, phase = %phase, "tool not allowed in phase");
                    json!({
                        "ok": false,
                        "error": format!(
                            "tool '{}' is not available in the {} phase", call.name, phase
                        ),
                    })
                };

                self.events
                    .emit(AgentEvent::ToolFinished {
                        tool: call.name.clone(),
                        output: output.clone(),
                    })
                    .await;
                messages.push(ChatMessage::tool(&call.id, &call.name, &output));
                fired.push(call.name.clone());
            }
            self.events.emit(AgentEvent::StepFinished { step }).await;

            // Early exits available from Planning.
            if fired.iter().any(|f| f == "clarify_intent") {
                if let Some(question) = self.ctx.state().clarification.clone() {
                    self.events.emit(AgentEvent::Done).await;
                    return Ok(AgentOutcome::Clarification { question });
                }
            }
            if fired.iter().any(|f| f == "finalize_no_data") {
                if let Some(answer) = self.ctx.state().no_data_answer.clone() {
                    self.events.emit(AgentEvent::Done).await;
                    return Ok(AgentOutcome::NoData { answer });
                }
            }

            // Phase transitions on terminal tools.
            let next = match phase {
                Phase::Planning
                    if fired.iter().any(|f| f == "finalize_plan")
                        && self.ctx.state().plan.is_some() =>
                {
                    Some(Phase::Building)
                }
                Phase::Building
                    if fired.iter().any(|f| f == "finalize_build")
                        && self.ctx.state().rendered.is_some()
                        && self.ctx.state().validated =>
                {
                    Some(Phase::Execution)
                }
                // Execution is terminal on the execute tool, success or
                // failure: Reporting still runs over a failed execution.
                Phase::Execution if fired.iter().any(|f| f == "execute_sql") => {
                    Some(Phase::Reporting)
                }
                Phase::Reporting if fired.iter().any(|f| f == "finalize_report") => {
                    let state = self.ctx.state();
                    let outcome = AgentOutcome::Report(FinalReport {
                        narrative: state.narrative.clone(),
                        artifact: state.artifact.clone(),
                        execution: state.execution.clone(),
                        sql: state.rendered.as_ref().map(|r| r.sql.clone()),
                    });
                    drop(state);
                    self.events.emit(AgentEvent::Done).await;
                    info!(session = %self.session_id, "request finished");
                    return Ok(outcome);
                }
                _ => None,
            };

            if let Some(next) = next {
                info!(from = %phase, to = %next, "phase transition");
                phase = next;
                self.events
                    .emit(AgentEvent::PhaseStarted {
                        phase: phase.name().to_string(),
                    })
                    .await;
            }
        }

        self.events
            .emit(AgentEvent::Error {
                message: format!("step limit of {} reached", self.max_steps),
            })
            .await;
        Err(AgentError::StepLimit(self.max_steps))
    }
}
