//! Agent Core
//!
//! This module implements the loop that drives one verification session.
//! Each session moves through an explicit state machine:
//!
//! ```text
//! Reasoning -> Acting -> Recording -> Reasoning ... -> Terminal
//! ```
//!
//! 1. `Reasoning`: build the prompt, ask the backend for one decision
//!    (retrying an unavailable backend with exponential backoff)
//! 2. `Acting`: a tool invocation is budget-checked and dispatched; a
//!    finalization has its citations checked against the evidence chain
//! 3. `Recording`: the observation becomes a finding and a `tool_result` event
//! 4. `Terminal`: finalized, failed or aborted; exactly one terminal event
//!    is emitted and the stream is closed
//!
//! Cancellation, client disconnect and the wall-clock budget are checked at
//! every transition. Tool failures are recorded and reasoned over; only
//! loop infrastructure failures end the session.

use judge_sdk::errors::{JudgeError, JudgeErrorExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::evidence::Observation;
use super::prompt::PromptBuilder;
use super::session::{FailureInfo, Session, SessionOutcome, SessionStatus};
use crate::config::{Config, FailurePolicy};
use crate::llm::{BackendError, Decision, Finalization, Message, ReasoningBackend};
use crate::stream::{EventKind, StreamEncoder};
use crate::tools::ToolRegistry;

/// Retry limits and grace periods of the loop
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    /// Backend calls per reasoning step before giving up
    pub backend_attempts: u32,
    /// First backoff between backend attempts; doubles each time
    pub backoff: Duration,
    /// Consecutive unparseable decisions tolerated
    pub malformed_retries: u32,
    /// Consecutive unknown-tool / invalid-argument decisions tolerated
    pub validation_retries: u32,
    /// Finalizations with dangling citations tolerated
    pub citation_retries: u32,
    /// Conversation entries replayed per prompt
    pub history_limit: usize,
    /// Time an in-flight tool call gets after cancellation
    pub cancel_grace: Duration,
    /// Time the client gets to drain the stream after the terminal event
    pub finish_grace: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            backend_attempts: 3,
            backoff: Duration::from_millis(500),
            malformed_retries: 2,
            validation_retries: 1,
            citation_retries: 1,
            history_limit: 8,
            cancel_grace: Duration::from_secs(2),
            finish_grace: Duration::from_secs(2),
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backend_attempts: config.agent.backend_attempts.max(1),
            backoff: config.agent.backoff(),
            malformed_retries: config.agent.malformed_retries,
            validation_retries: config.agent.validation_retries,
            citation_retries: config.agent.citation_retries,
            history_limit: config.agent.history_limit,
            cancel_grace: config.agent.cancel_grace(),
            finish_grace: Duration::from_millis(config.stream.finish_grace_ms),
        }
    }
}

/// How a session ended
#[derive(Debug)]
enum Termination {
    Finalized(Finalization),
    Failed(JudgeError),
    Aborted(String),
}

/// Loop state between transitions
#[derive(Debug)]
enum LoopState {
    Reasoning,
    Acting(Decision),
    Recording(Observation),
    Terminal(Termination),
}

/// Re-prompt counters
#[derive(Debug, Default)]
struct Strikes {
    malformed: u32,
    validation: u32,
    citation: u32,
}

/// Agent Core that drives sessions to a verdict
pub struct AgentCore {
    backend: Arc<dyn ReasoningBackend>,
    tools: Arc<ToolRegistry>,
    prompts: PromptBuilder,
    settings: AgentSettings,
}

/// Mutable state of one run, kept together so transitions can borrow it
struct Run<'a> {
    session: Session,
    events: StreamEncoder,
    cancel: &'a CancellationToken,
    conversation: Vec<Message>,
    strikes: Strikes,
}

impl AgentCore {
    /// Create a new agent core
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        tools: Arc<ToolRegistry>,
        prompts: PromptBuilder,
        settings: AgentSettings,
    ) -> Self {
        Self {
            backend,
            tools,
            prompts,
            settings,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Drive `session` to a terminal state.
    ///
    /// Always emits exactly one terminal event on `events` and closes the
    /// stream before returning.
    pub async fn run(
        &self,
        session: Session,
        events: StreamEncoder,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let span = info_span!("session", session_id = %session.id);
        async move {
            info!(
                "Starting session: {} ({} media, budget {} calls / {}s)",
                session.claim,
                session.media.len(),
                session.budget.max_iterations,
                session.budget.max_wall_clock.as_secs()
            );
            let mut run = Run {
                session,
                events,
                cancel: &cancel,
                conversation: Vec::new(),
                strikes: Strikes::default(),
            };

            let mut state = LoopState::Reasoning;
            let termination = loop {
                if !matches!(state, LoopState::Terminal(_)) {
                    if let Some(stop) = self.interruption(&run) {
                        state = LoopState::Terminal(stop);
                    }
                }
                debug!("Loop state: {}", state_name(&state));
                state = match state {
                    LoopState::Reasoning => self.reason(&mut run).await,
                    LoopState::Acting(decision) => self.act(&mut run, decision).await,
                    LoopState::Recording(observation) => self.record(&mut run, observation),
                    LoopState::Terminal(termination) => break termination,
                };
            };

            self.terminate(run, termination).await
        }
        .instrument(span)
        .await
    }

    /// External reasons to stop, checked before every transition
    fn interruption(&self, run: &Run<'_>) -> Option<Termination> {
        if run.cancel.is_cancelled() {
            return Some(Termination::Aborted("session cancelled".to_string()));
        }
        if run.events.is_disconnected() {
            return Some(Termination::Aborted("client disconnected".to_string()));
        }
        if run.session.out_of_time() {
            return Some(Termination::Failed(JudgeError::BudgetExceeded(format!(
                "wall-clock budget of {}s exhausted",
                run.session.budget.max_wall_clock.as_secs()
            ))));
        }
        None
    }

    async fn reason(&self, run: &mut Run<'_>) -> LoopState {
        let prompt = self.prompts.build(
            &run.session,
            &self.tools,
            &run.conversation,
            self.settings.history_limit,
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call = tokio::time::timeout(
                run.session.time_remaining(),
                self.backend.decide(&prompt),
            );
            let result = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => {
                    return LoopState::Terminal(Termination::Aborted(
                        "session cancelled while reasoning".to_string(),
                    ));
                }
                result = call => result,
            };

            match result {
                Err(_elapsed) => {
                    return LoopState::Terminal(Termination::Failed(JudgeError::BudgetExceeded(
                        format!(
                            "wall-clock budget of {}s exhausted while reasoning",
                            run.session.budget.max_wall_clock.as_secs()
                        ),
                    )));
                }
                Ok(Ok(decision)) => {
                    run.strikes.malformed = 0;
                    return LoopState::Acting(decision);
                }
                Ok(Err(BackendError::Unavailable(reason))) => {
                    if attempt >= self.settings.backend_attempts {
                        error!(
                            "Backend {} unavailable after {} attempts: {}",
                            self.backend.name(),
                            attempt,
                            reason
                        );
                        return LoopState::Terminal(Termination::Failed(
                            JudgeError::BackendUnavailable(reason),
                        ));
                    }
                    let delay = backoff_delay(self.settings.backoff, attempt);
                    warn!(
                        "Backend unavailable (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.settings.backend_attempts, delay, reason
                    );
                    tokio::select! {
                        biased;
                        _ = run.cancel.cancelled() => {
                            return LoopState::Terminal(Termination::Aborted(
                                "session cancelled while reasoning".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(Err(BackendError::Malformed(reason))) => {
                    run.strikes.malformed += 1;
                    let err = JudgeError::MalformedDecision(reason);
                    if run.strikes.malformed > self.settings.malformed_retries {
                        return LoopState::Terminal(Termination::Failed(err));
                    }
                    self.report_recoverable(run, &err, None);
                    run.conversation.push(Message::user(format!(
                        "Your last answer could not be used: {}. Reply with exactly one decision object.",
                        err
                    )));
                    return LoopState::Reasoning;
                }
            }
        }
    }

    async fn act(&self, run: &mut Run<'_>, decision: Decision) -> LoopState {
        if let Some(thought) = decision.thought() {
            emit(
                &mut run.events,
                EventKind::Thinking,
                json!({"iteration": run.session.iteration, "thought": thought}),
            );
        }
        run.conversation.push(Message::assistant(
            serde_json::to_string(&decision).unwrap_or_default(),
        ));

        match decision {
            Decision::InvokeTool(invocation) => {
                if run.session.iteration >= run.session.budget.max_iterations {
                    return LoopState::Terminal(Termination::Failed(JudgeError::BudgetExceeded(
                        format!(
                            "max iterations ({}) reached",
                            run.session.budget.max_iterations
                        ),
                    )));
                }
                run.session.iteration += 1;
                let iteration = run.session.iteration;

                emit(
                    &mut run.events,
                    EventKind::ToolCall,
                    json!({
                        "iteration": iteration,
                        "tool": invocation.tool,
                        "arguments": invocation.arguments,
                    }),
                );

                let dispatch = self.tools.dispatch(
                    &invocation.tool,
                    &invocation.arguments,
                    run.cancel,
                    self.settings.cancel_grace,
                );
                let Ok(dispatched) =
                    tokio::time::timeout(run.session.time_remaining(), dispatch).await
                else {
                    return LoopState::Terminal(Termination::Failed(JudgeError::BudgetExceeded(
                        format!(
                            "wall-clock budget of {}s exhausted while '{}' was running",
                            run.session.budget.max_wall_clock.as_secs(),
                            invocation.tool
                        ),
                    )));
                };

                match dispatched {
                    Ok(observation) => {
                        run.strikes.validation = 0;
                        LoopState::Recording(observation)
                    }
                    Err(err @ (JudgeError::UnknownTool(_) | JudgeError::InvalidArguments { .. })) => {
                        run.strikes.validation += 1;
                        if run.strikes.validation > self.settings.validation_retries {
                            return LoopState::Terminal(Termination::Failed(err));
                        }
                        self.report_recoverable(run, &err, Some(invocation.tool.as_str()));
                        let feedback = match &err {
                            JudgeError::UnknownTool(_) => format!(
                                "{}. Available tools: {}.",
                                err,
                                self.tools.names().join(", ")
                            ),
                            _ => format!("{}. Fix the arguments and try again.", err),
                        };
                        run.conversation.push(Message::user(feedback));
                        LoopState::Reasoning
                    }
                    Err(JudgeError::Aborted(reason)) => {
                        LoopState::Terminal(Termination::Aborted(reason))
                    }
                    Err(err) => LoopState::Terminal(Termination::Failed(err)),
                }
            }
            Decision::Finalize(finalization) => {
                let missing = run.session.evidence.unresolved(&finalization.cited_evidence);
                if missing.is_empty() {
                    return LoopState::Terminal(Termination::Finalized(finalization));
                }

                run.strikes.citation += 1;
                let err = JudgeError::InvalidCitation(missing);
                if run.strikes.citation > self.settings.citation_retries {
                    return LoopState::Terminal(Termination::Failed(err));
                }
                // Keep what was validly cited visible for the retry
                for id in &finalization.cited_evidence {
                    run.session.evidence.pin(*id);
                }
                self.report_recoverable(run, &err, None);
                let valid = if run.session.evidence.is_empty() {
                    "there are no findings yet".to_string()
                } else {
                    format!("valid ids are 1 to {}", run.session.evidence.len())
                };
                run.conversation.push(Message::user(format!(
                    "{}; {}. Cite only existing findings, or gather more evidence first.",
                    err, valid
                )));
                LoopState::Reasoning
            }
        }
    }

    fn record(&self, run: &mut Run<'_>, observation: Observation) -> LoopState {
        let iteration = run.session.iteration;
        let tool = observation.tool.clone();
        let fatal = observation.is_provider_fault()
            && self
                .tools
                .resolve(&tool)
                .map(|spec| spec.limits.failure_policy == FailurePolicy::Fatal)
                .unwrap_or(false);
        let detail = observation.error.clone();

        let id = match run.session.evidence.append(iteration, observation) {
            Ok(id) => id,
            Err(err) => return LoopState::Terminal(Termination::Failed(err)),
        };
        let finding = run.session.evidence.get(id).cloned();
        emit(
            &mut run.events,
            EventKind::ToolResult,
            json!({"iteration": iteration, "finding": finding}),
        );

        let summary = match &detail {
            None => format!("Finding #{} recorded from {}.", id, tool),
            Some(detail) => format!("Finding #{} recorded from {} (failed: {}).", id, tool, detail),
        };
        run.conversation.push(Message::user(summary));

        if fatal {
            return LoopState::Terminal(Termination::Failed(JudgeError::ToolFailed {
                tool,
                detail: detail.unwrap_or_else(|| "provider failure".to_string()),
            }));
        }
        LoopState::Reasoning
    }

    fn report_recoverable(&self, run: &mut Run<'_>, err: &JudgeError, tool: Option<&str>) {
        warn!("Recoverable error, re-prompting: {}", err);
        let mut payload = error_payload(err, false);
        payload["iteration"] = json!(run.session.iteration);
        if let Some(tool) = tool {
            payload["tool"] = json!(tool);
        }
        emit(&mut run.events, EventKind::Error, payload);
    }

    async fn terminate(&self, run: Run<'_>, termination: Termination) -> SessionOutcome {
        let Run {
            mut session,
            mut events,
            ..
        } = run;
        session.evidence.seal();

        let mut outcome_verdict = None;
        let mut outcome_rationale = None;
        let mut citations = Vec::new();
        let mut failure = None;

        let (kind, payload) = match termination {
            Termination::Finalized(fin) => {
                session.status = SessionStatus::Finalized;
                info!(
                    "Session finalized: {} citing {:?} after {} tool calls",
                    fin.verdict, fin.cited_evidence, session.iteration
                );
                let payload = json!({
                    "status": session.status,
                    "verdict": fin.verdict,
                    "rationale": fin.rationale,
                    "citations": fin.cited_evidence,
                    "iterations": session.iteration,
                    "evidence": session.evidence.full(),
                });
                outcome_verdict = Some(fin.verdict);
                outcome_rationale = Some(fin.rationale);
                citations = fin.cited_evidence;
                (EventKind::Final, payload)
            }
            Termination::Failed(err) => {
                session.status = SessionStatus::Failed;
                error!("Session failed ({}): {}", err.code(), err);
                failure = Some(FailureInfo {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                (EventKind::Error, self.terminal_payload(&session, &err))
            }
            Termination::Aborted(reason) => {
                session.status = SessionStatus::Aborted;
                info!("Session aborted: {}", reason);
                let err = JudgeError::Aborted(reason);
                failure = Some(FailureInfo {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                (EventKind::Error, self.terminal_payload(&session, &err))
            }
        };
        emit(&mut events, kind, payload);

        let log = events.finish(self.settings.finish_grace).await;

        SessionOutcome {
            session_id: session.id,
            claim: session.claim,
            media: session.media,
            status: session.status,
            verdict: outcome_verdict,
            rationale: outcome_rationale,
            citations,
            failure,
            iterations: session.iteration,
            started_at: session.started_at,
            finished_at: chrono::Utc::now(),
            evidence: session.evidence.full().to_vec(),
            events: log,
        }
    }

    fn terminal_payload(&self, session: &Session, err: &JudgeError) -> Value {
        let mut payload = error_payload(err, true);
        payload["status"] = json!(session.status);
        payload["iterations"] = json!(session.iteration);
        payload["evidence"] = json!(session.evidence.full());
        payload
    }
}

fn emit(events: &mut StreamEncoder, kind: EventKind, payload: Value) {
    if let Err(e) = events.emit(kind, payload) {
        debug!("Not emitting {} event: {}", kind, e);
    }
}

/// Wire shape of an `error` event
fn error_payload(err: &JudgeError, terminal: bool) -> Value {
    json!({
        "code": err.code(),
        "message": err.to_string(),
        "hint": err.user_hint(),
        "recoverable": !terminal && err.is_recoverable(),
        "terminal": terminal,
    })
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ...
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

fn state_name(state: &LoopState) -> &'static str {
    match state {
        LoopState::Reasoning => "reasoning",
        LoopState::Acting(_) => "acting",
        LoopState::Recording(_) => "recording",
        LoopState::Terminal(_) => "terminal",
    }
}
