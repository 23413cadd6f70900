/// Session archive
///
/// Persists terminal sessions for audit and replay. Findings and stream
/// events are stored as JSON documents keyed by their id / sequence number,
/// so a session can be read back exactly as the client saw it.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::agent::evidence::{Finding, FindingId};
use crate::agent::session::{FailureInfo, MediaRef, SessionOutcome, SessionStatus};
use crate::llm::Verdict;
use crate::stream::StreamEvent;

/// Summary row of an archived session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub session_id: String,
    pub claim: String,
    pub media: Vec<MediaRef>,
    pub status: SessionStatus,
    pub verdict: Option<Verdict>,
    pub rationale: Option<String>,
    pub citations: Vec<FindingId>,
    pub failure: Option<FailureInfo>,
    pub iterations: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Archive repository for terminal sessions
#[derive(Clone)]
pub struct SessionArchive {
    pool: SqlitePool,
}

const SESSION_COLUMNS: &str = "id, claim, media, status, verdict, rationale, citations, \
     failure_code, failure_message, iterations, started_at, finished_at";

impl SessionArchive {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a terminal session with its evidence chain and event log.
    ///
    /// Saving the same session twice replaces the earlier copy.
    pub async fn save(&self, outcome: &SessionOutcome) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin archive transaction")?;

        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(&outcome.session_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear previous archive entry")?;

        sqlx::query(
            "INSERT INTO sessions (id, claim, media, status, verdict, rationale, citations, \
             failure_code, failure_message, iterations, started_at, finished_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&outcome.session_id)
        .bind(&outcome.claim)
        .bind(serde_json::to_string(&outcome.media)?)
        .bind(outcome.status.as_str())
        .bind(outcome.verdict.map(|v| v.as_str()))
        .bind(&outcome.rationale)
        .bind(serde_json::to_string(&outcome.citations)?)
        .bind(outcome.failure.as_ref().map(|f| f.code.as_str()))
        .bind(outcome.failure.as_ref().map(|f| f.message.as_str()))
        .bind(i64::from(outcome.iterations))
        .bind(outcome.started_at.timestamp_millis())
        .bind(outcome.finished_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .context("Failed to archive session")?;

        for finding in &outcome.evidence {
            sqlx::query(
                "INSERT INTO findings (session_id, finding_id, iteration, tool, success, body) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&outcome.session_id)
            .bind(finding.id as i64)
            .bind(i64::from(finding.iteration))
            .bind(&finding.observation.tool)
            .bind(finding.observation.success)
            .bind(serde_json::to_string(finding)?)
            .execute(&mut *tx)
            .await
            .context("Failed to archive finding")?;
        }

        for event in &outcome.events {
            sqlx::query(
                "INSERT INTO stream_events (session_id, seq, kind, body) VALUES (?, ?, ?, ?)",
            )
            .bind(&outcome.session_id)
            .bind(event.seq as i64)
            .bind(event.kind.as_str())
            .bind(serde_json::to_string(event)?)
            .execute(&mut *tx)
            .await
            .context("Failed to archive stream event")?;
        }

        tx.commit()
            .await
            .context("Failed to commit archive transaction")?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<ArchivedSession>> {
        let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch archived session")?;

        row.as_ref().map(session_from_row).transpose()
    }

    /// Most recently started sessions first
    pub async fn recent_sessions(&self, limit: i64) -> Result<Vec<ArchivedSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sessions ORDER BY started_at DESC LIMIT ?",
            SESSION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent sessions")?;

        rows.iter().map(session_from_row).collect()
    }

    /// Evidence chain in append order
    pub async fn findings(&self, session_id: &str) -> Result<Vec<Finding>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM findings WHERE session_id = ? ORDER BY finding_id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch findings")?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("Corrupt finding in archive"))
            .collect()
    }

    /// Stream events in sequence order
    pub async fn events(&self, session_id: &str) -> Result<Vec<StreamEvent>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM stream_events WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stream events")?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("Corrupt stream event in archive"))
            .collect()
    }

    /// Reassemble the full outcome of an archived session
    pub async fn load_outcome(&self, session_id: &str) -> Result<Option<SessionOutcome>> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        let evidence = self.findings(session_id).await?;
        let events = self.events(session_id).await?;

        Ok(Some(SessionOutcome {
            session_id: session.session_id,
            claim: session.claim,
            media: session.media,
            status: session.status,
            verdict: session.verdict,
            rationale: session.rationale,
            citations: session.citations,
            failure: session.failure,
            iterations: session.iterations,
            started_at: session.started_at,
            finished_at: session.finished_at,
            evidence,
            events,
        }))
    }
}

fn session_from_row(r: &SqliteRow) -> Result<ArchivedSession> {
    let status: String = r.get("status");
    let failure_code: Option<String> = r.get("failure_code");
    let failure_message: Option<String> = r.get("failure_message");

    Ok(ArchivedSession {
        session_id: r.get("id"),
        claim: r.get("claim"),
        media: serde_json::from_str(&r.get::<String, _>("media"))
            .context("Corrupt media list in archive")?,
        status: status.parse().unwrap_or(SessionStatus::Failed),
        verdict: r
            .get::<Option<String>, _>("verdict")
            .as_deref()
            .and_then(Verdict::parse),
        rationale: r.get("rationale"),
        citations: serde_json::from_str(&r.get::<String, _>("citations"))
            .context("Corrupt citation list in archive")?,
        failure: failure_code.map(|code| FailureInfo {
            code,
            message: failure_message.unwrap_or_default(),
        }),
        iterations: r.get::<i64, _>("iterations").try_into().unwrap_or(0),
        started_at: from_millis(r.get("started_at")),
        finished_at: from_millis(r.get("finished_at")),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
