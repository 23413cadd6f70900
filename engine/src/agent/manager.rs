//! Session API
//!
//! `SessionManager` is what the hosting layer talks to: it starts sessions
//! on their own tasks, hands out the single event stream of each session,
//! forwards aborts and keeps terminal outcomes available for lookup.

use judge_sdk::errors::JudgeError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::core::AgentCore;
use super::session::{Budget, MediaRef, Session, SessionOutcome, SessionStatus};
use crate::config::{Config, StreamConfig};
use crate::db::SessionArchive;
use crate::stream::{self, EventStream};

/// Terminal sessions kept in memory before the oldest are dropped
const RETAIN_TERMINAL: usize = 256;

struct SessionHandle {
    cancel: CancellationToken,
    events: Option<EventStream>,
    status: SessionStatus,
    outcome: Option<SessionOutcome>,
    /// Flips to true once the session is terminal and archived
    done: watch::Sender<bool>,
    /// Start order, used to prune the oldest terminal sessions
    order: u64,
}

#[derive(Default)]
struct Sessions {
    handles: HashMap<String, SessionHandle>,
    next_order: u64,
}

/// Starts, streams and aborts verification sessions
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<AgentCore>,
    stream: StreamConfig,
    default_budget: Budget,
    archive: Option<SessionArchive>,
    sessions: Arc<Mutex<Sessions>>,
}

impl SessionManager {
    pub fn new(
        core: Arc<AgentCore>,
        stream: StreamConfig,
        default_budget: Budget,
        archive: Option<SessionArchive>,
    ) -> Self {
        Self {
            core,
            stream,
            default_budget,
            archive,
            sessions: Arc::new(Mutex::new(Sessions::default())),
        }
    }

    pub fn from_config(
        core: Arc<AgentCore>,
        config: &Config,
        archive: Option<SessionArchive>,
    ) -> Self {
        let budget = Budget::new(config.agent.max_iterations, config.agent.max_wall_clock());
        Self::new(core, config.stream.clone(), budget, archive)
    }

    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    pub fn archive(&self) -> Option<&SessionArchive> {
        self.archive.as_ref()
    }

    pub fn default_budget(&self) -> Budget {
        self.default_budget
    }

    /// Start a session and return its id.
    ///
    /// The loop runs on its own task; events are buffered until a client
    /// takes the stream with [`stream_events`](Self::stream_events).
    pub async fn start_session(
        &self,
        claim: impl Into<String>,
        media: Vec<MediaRef>,
        budget: Option<Budget>,
    ) -> Result<String, JudgeError> {
        let claim = claim.into();
        if claim.trim().is_empty() {
            return Err(JudgeError::InvalidArguments {
                tool: "session".to_string(),
                problems: vec!["claim must not be empty".to_string()],
            });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let budget = budget.unwrap_or(self.default_budget);
        let session = Session::new(&session_id, claim, media, budget);
        let (encoder, events) = stream::channel_from_config(&session_id, &self.stream);
        let cancel = CancellationToken::new();

        {
            let mut sessions = self.sessions.lock().await;
            let order = sessions.next_order;
            sessions.next_order += 1;
            sessions.handles.insert(
                session_id.clone(),
                SessionHandle {
                    cancel: cancel.clone(),
                    events: Some(events),
                    status: SessionStatus::Running,
                    outcome: None,
                    done: watch::Sender::new(false),
                    order,
                },
            );
        }

        let core = Arc::clone(&self.core);
        let run = tokio::spawn(async move { core.run(session, encoder, cancel).await });

        let manager = self.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            match run.await {
                Ok(outcome) => manager.complete(outcome).await,
                Err(e) => {
                    error!("Session {} loop task died: {}", id, e);
                    manager.mark_failed(&id).await;
                }
            }
        });

        info!("Started session {}", session_id);
        Ok(session_id)
    }

    /// Take the event stream of a session. Only one client may take it.
    ///
    /// A session that is no longer held in memory is replayed from the
    /// archive.
    pub async fn stream_events(&self, session_id: &str) -> Result<EventStream, JudgeError> {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(handle) = sessions.handles.get_mut(session_id) {
                return handle
                    .events
                    .take()
                    .ok_or_else(|| JudgeError::StreamAlreadyTaken(session_id.to_string()));
            }
        }
        match self.archived(session_id).await? {
            Some(outcome) => Ok(EventStream::replay(session_id, outcome.events)),
            None => Err(JudgeError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Wait until a session is terminal and its outcome has been archived
    pub async fn wait_for_completion(&self, session_id: &str) -> Result<SessionStatus, JudgeError> {
        let done = {
            let sessions = self.sessions.lock().await;
            sessions.handles.get(session_id).map(|h| h.done.subscribe())
        };
        if let Some(mut done) = done {
            // The sender lives in the handle; pruning drops it only after completion
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status(session_id).await
    }

    /// Request cancellation. Aborting a terminal session is a no-op.
    pub async fn abort_session(&self, session_id: &str) -> Result<SessionStatus, JudgeError> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .handles
            .get(session_id)
            .ok_or_else(|| JudgeError::SessionNotFound(session_id.to_string()))?;
        if !handle.status.is_terminal() {
            info!("Abort requested for session {}", session_id);
            handle.cancel.cancel();
        }
        Ok(handle.status)
    }

    /// Current status, from memory or the archive
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, JudgeError> {
        if let Some(handle) = self.sessions.lock().await.handles.get(session_id) {
            return Ok(handle.status);
        }
        match self.archived(session_id).await? {
            Some(outcome) => Ok(outcome.status),
            None => Err(JudgeError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Outcome of a terminal session; `None` while it is still running
    pub async fn outcome(&self, session_id: &str) -> Result<Option<SessionOutcome>, JudgeError> {
        if let Some(handle) = self.sessions.lock().await.handles.get(session_id) {
            return Ok(handle.outcome.clone());
        }
        match self.archived(session_id).await? {
            Some(outcome) => Ok(Some(outcome)),
            None => Err(JudgeError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Number of sessions still running
    pub async fn running(&self) -> usize {
        self.sessions
            .lock()
            .await
            .handles
            .values()
            .filter(|h| !h.status.is_terminal())
            .count()
    }

    /// Cancel every running session
    pub async fn shutdown(&self) {
        let sessions = self.sessions.lock().await;
        for (id, handle) in sessions.handles.iter() {
            if !handle.status.is_terminal() {
                info!("Cancelling session {} for shutdown", id);
                handle.cancel.cancel();
            }
        }
    }

    async fn archived(&self, session_id: &str) -> Result<Option<SessionOutcome>, JudgeError> {
        let Some(archive) = &self.archive else {
            return Ok(None);
        };
        archive
            .load_outcome(session_id)
            .await
            .map_err(|e| JudgeError::Database(format!("{:#}", e)))
    }

    async fn complete(&self, outcome: SessionOutcome) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.save(&outcome).await {
                warn!("Failed to archive session {}: {:#}", outcome.session_id, e);
            }
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.handles.get_mut(&outcome.session_id) {
            handle.status = outcome.status;
            handle.outcome = Some(outcome);
            handle.done.send_replace(true);
        }
        prune(&mut sessions);
    }

    async fn mark_failed(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.handles.get_mut(session_id) {
            handle.status = SessionStatus::Failed;
            handle.cancel.cancel();
            handle.outcome = None;
            handle.done.send_replace(true);
        }
        prune(&mut sessions);
    }
}

/// Drop the oldest terminal sessions beyond the retention limit
fn prune(sessions: &mut Sessions) {
    let mut terminal: Vec<(u64, String)> = sessions
        .handles
        .iter()
        .filter(|(_, h)| h.status.is_terminal())
        .map(|(id, h)| (h.order, id.clone()))
        .collect();
    if terminal.len() <= RETAIN_TERMINAL {
        return;
    }
    terminal.sort_unstable();
    let excess = terminal.len() - RETAIN_TERMINAL;
    for (_, id) in terminal.into_iter().take(excess) {
        sessions.handles.remove(&id);
    }
}
