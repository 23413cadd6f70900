//! Streaming Protocol Encoder
//!
//! Turns loop transitions into an ordered sequence of [`StreamEvent`]s for the
//! client. The encoder sits on a bounded channel and never awaits while the
//! loop is running: when the client is slow, events wait in an ordered
//! backlog, and when the backlog overflows the oldest `thinking` events are
//! dropped first. The terminal event is never dropped.
//!
//! Every emitted event is also kept in an audit log, independent of delivery,
//! so the complete sequence can be archived and replayed. The log is shared
//! with the consumer: once the channel closes, whatever the channel never
//! carried (a late subscriber, a flush that ran out of grace) is read from
//! the log, so the consumer always ends on the terminal event.
//!
//! An encoder dropped before its terminal event (the loop task died) emits
//! a terminal `error` on the way out.

use chrono::{DateTime, Utc};
use futures::Stream;
use judge_sdk::errors::JudgeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::config::StreamConfig;

/// Kind of a stream event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Thinking,
    ToolCall,
    ToolResult,
    Error,
    Final,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Thinking => "thinking",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Error => "error",
            EventKind::Final => "final",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of progress sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: u64,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    /// `final`, or an `error` flagged as terminal
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            EventKind::Final => true,
            EventKind::Error => self
                .payload
                .get("terminal")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Server-sent events frame
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.seq, self.kind, data)
    }
}

/// Events dropped because the client could not keep up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropStats {
    pub thinking: u64,
    pub other: u64,
}

impl DropStats {
    pub fn total(&self) -> u64 {
        self.thinking + self.other
    }
}

/// Create an encoder/receiver pair for one session
pub fn channel(
    session_id: impl Into<String>,
    capacity: usize,
    backlog_limit: usize,
) -> (StreamEncoder, EventStream) {
    let session_id = session_id.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let log: SharedLog = Arc::new(Mutex::new(Vec::new()));
    (
        StreamEncoder {
            session_id: session_id.clone(),
            tx,
            backlog: VecDeque::new(),
            backlog_limit,
            next_seq: 1,
            log: Arc::clone(&log),
            dropped: DropStats::default(),
            disconnected: false,
            terminated: false,
        },
        EventStream {
            session_id,
            rx,
            log,
            last_seq: 0,
            closed: false,
        },
    )
}

/// Create a pair sized from the `[stream]` config section
pub fn channel_from_config(
    session_id: impl Into<String>,
    config: &StreamConfig,
) -> (StreamEncoder, EventStream) {
    channel(session_id, config.channel_capacity, config.backlog_limit)
}

/// Producer side, owned by the agent loop
#[derive(Debug)]
pub struct StreamEncoder {
    session_id: String,
    tx: mpsc::Sender<StreamEvent>,
    backlog: VecDeque<StreamEvent>,
    backlog_limit: usize,
    next_seq: u64,
    log: SharedLog,
    dropped: DropStats,
    disconnected: bool,
    terminated: bool,
}

impl StreamEncoder {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emit an event and return its sequence number.
    ///
    /// Never blocks. Terminal payloads that are objects get a
    /// `dropped_events` field. Fails with `SessionFinalized` after a terminal
    /// event has been emitted.
    pub fn emit(&mut self, kind: EventKind, payload: Value) -> Result<u64, JudgeError> {
        if self.terminated {
            return Err(JudgeError::SessionFinalized);
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let mut event = StreamEvent {
            seq,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        let is_terminal = event.is_terminal();
        if is_terminal {
            self.terminated = true;
            stamp_drops(&mut event, self.dropped);
        }
        lock(&self.log).push(event.clone());

        if self.disconnected {
            return Ok(seq);
        }

        self.pump();
        if self.backlog.is_empty() && !self.disconnected {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => self.backlog.push_back(event),
                Err(TrySendError::Closed(_)) => self.mark_disconnected(),
            }
        } else if !self.disconnected {
            self.backlog.push_back(event);
        }

        let before = self.dropped;
        self.enforce_backlog_limit();
        if is_terminal && self.dropped != before {
            // The terminal event is still queued; report the final counts
            let dropped = self.dropped;
            if let Some(queued) = self.backlog.back_mut().filter(|e| e.seq == seq) {
                stamp_drops(queued, dropped);
            }
            if let Some(logged) = lock(&self.log).last_mut() {
                stamp_drops(logged, dropped);
            }
        }

        Ok(seq)
    }

    /// Whether the client side has gone away
    pub fn is_disconnected(&self) -> bool {
        self.disconnected || self.tx.is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn dropped(&self) -> DropStats {
        self.dropped
    }

    /// Events currently held back
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Every event emitted so far, in sequence order
    pub fn log(&self) -> Vec<StreamEvent> {
        lock(&self.log).clone()
    }

    /// Flush the backlog for at most `grace`, close the channel and return
    /// the audit log.
    pub async fn finish(mut self, grace: Duration) -> Vec<StreamEvent> {
        let deadline = tokio::time::Instant::now() + grace;
        while let Some(event) = self.backlog.pop_front() {
            if self.disconnected {
                break;
            }
            match tokio::time::timeout_at(deadline, self.tx.send(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => self.mark_disconnected(),
                Err(_) => {
                    warn!(
                        "Session {}: client did not drain the stream within {:?}, {} events undelivered",
                        self.session_id,
                        grace,
                        self.backlog.len() + 1
                    );
                    break;
                }
            }
        }
        let log = self.log();
        debug!(
            "Session {}: stream closed after {} events",
            self.session_id,
            log.len()
        );
        log
    }

    /// Move backlog entries into the channel while it has room
    fn pump(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.mark_disconnected();
                    break;
                }
            }
        }
    }

    fn mark_disconnected(&mut self) {
        if !self.disconnected {
            debug!("Session {}: stream receiver dropped", self.session_id);
        }
        self.disconnected = true;
        self.backlog.clear();
    }

    fn enforce_backlog_limit(&mut self) {
        while self.backlog.len() > self.backlog_limit {
            if let Some(pos) = self
                .backlog
                .iter()
                .position(|e| e.kind == EventKind::Thinking)
            {
                self.backlog.remove(pos);
                self.dropped.thinking += 1;
            } else if let Some(pos) = self.backlog.iter().position(|e| !e.is_terminal()) {
                self.backlog.remove(pos);
                self.dropped.other += 1;
            } else {
                break;
            }
        }
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        warn!(
            "Session {}: stream closed without a terminal event",
            self.session_id
        );
        let payload = json!({
            "code": "internal_error",
            "message": "session ended unexpectedly",
            "status": "failed",
            "recoverable": false,
            "terminal": true,
        });
        if let Err(e) = self.emit(EventKind::Error, payload) {
            debug!("Session {}: {}", self.session_id, e);
        }
    }
}

type SharedLog = Arc<Mutex<Vec<StreamEvent>>>;

fn lock(log: &SharedLog) -> MutexGuard<'_, Vec<StreamEvent>> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stamp_drops(event: &mut StreamEvent, dropped: DropStats) {
    if let Some(obj) = event.payload.as_object_mut() {
        obj.insert("dropped_events".to_string(), json!(dropped));
    }
}

/// Consumer side, handed to the one client streaming the session
#[derive(Debug)]
pub struct EventStream {
    session_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    log: SharedLog,
    /// Highest sequence number handed out so far
    last_seq: u64,
    closed: bool,
}

impl EventStream {
    /// Stream over an already complete sequence, e.g. read from the archive
    pub fn replay(session_id: impl Into<String>, events: Vec<StreamEvent>) -> Self {
        let (_, rx) = mpsc::channel(1);
        Self {
            session_id: session_id.into(),
            rx,
            log: Arc::new(Mutex::new(events)),
            last_seq: 0,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, or `None` once the encoder has finished and the tail of
    /// the log has been handed out
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if !self.closed {
            if let Some(event) = self.rx.recv().await {
                self.last_seq = event.seq;
                return Some(event);
            }
            self.closed = true;
        }

        let last_seq = self.last_seq;
        let event = lock(&self.log)
            .iter()
            .find(|e| e.seq > last_seq)
            .cloned()?;
        self.last_seq = event.seq;
        Some(event)
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures::stream::unfold(self, |mut events| async move {
            let event = events.next().await?;
            Some((event, events))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_sequence_numbers_start_at_one_and_increase() {
        let (mut encoder, mut stream) = channel("s1", 8, 8);

        assert_eq!(encoder.emit(EventKind::Thinking, json!({"thought": "a"})).unwrap(), 1);
        assert_eq!(encoder.emit(EventKind::ToolCall, json!({"tool": "ocr"})).unwrap(), 2);

        assert_eq!(stream.next().await.unwrap().seq, 1);
        assert_eq!(stream.next().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_slow_client_gets_backlog_in_order() {
        let (mut encoder, mut stream) = channel("s1", 1, 16);

        for i in 0..5 {
            encoder
                .emit(EventKind::ToolResult, json!({"i": i}))
                .unwrap();
        }
        assert_eq!(encoder.backlog_len(), 4);
        encoder.emit(EventKind::Final, json!({"verdict": "supported"})).unwrap();

        let reader = tokio::spawn(async move {
            let mut seqs = Vec::new();
            while let Some(event) = stream.next().await {
                seqs.push(event.seq);
            }
            seqs
        });

        let log = encoder.finish(Duration::from_secs(1)).await;
        assert_eq!(log.len(), 6);
        assert_eq!(reader.await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_overflow_drops_thinking_first_and_keeps_terminal() {
        let (mut encoder, mut stream) = channel("s1", 1, 2);

        encoder.emit(EventKind::ToolCall, json!({})).unwrap(); // in channel
        encoder.emit(EventKind::Thinking, json!({})).unwrap(); // backlog
        encoder.emit(EventKind::ToolResult, json!({})).unwrap(); // backlog
        encoder.emit(EventKind::ToolCall, json!({})).unwrap(); // drops the thinking
        assert_eq!(encoder.dropped(), DropStats { thinking: 1, other: 0 });

        encoder.emit(EventKind::Final, json!({"verdict": "refuted"})).unwrap();
        assert_eq!(encoder.dropped().other, 1);

        let reader = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = stream.next().await {
                events.push(event);
            }
            events
        });
        let log = encoder.finish(Duration::from_secs(1)).await;
        let delivered = reader.await.unwrap();

        assert_eq!(log.len(), 5);
        let last = delivered.last().unwrap();
        assert_eq!(last.kind, EventKind::Final);
        assert_eq!(last.payload["dropped_events"]["thinking"], 1);
        assert_eq!(last.payload["dropped_events"]["other"], 1);
        assert!(delivered.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_disconnected_client_never_blocks_emission() {
        let (mut encoder, stream) = channel("s1", 1, 1);
        drop(stream);

        for _ in 0..10 {
            encoder.emit(EventKind::Thinking, json!({})).unwrap();
        }
        assert!(encoder.is_disconnected());
        assert_eq!(encoder.log().len(), 10);
        assert_eq!(encoder.backlog_len(), 0);
    }

    #[tokio::test]
    async fn test_emit_after_terminal_is_rejected() {
        let (mut encoder, _stream) = channel("s1", 4, 4);
        encoder
            .emit(EventKind::Error, json!({"code": "budget_exceeded", "terminal": true}))
            .unwrap();

        assert!(encoder.is_terminated());
        assert!(matches!(
            encoder.emit(EventKind::Thinking, json!({})),
            Err(JudgeError::SessionFinalized)
        ));
    }

    #[tokio::test]
    async fn test_finish_gives_up_after_grace() {
        let (mut encoder, _stream) = channel("s1", 1, 8);
        encoder.emit(EventKind::ToolCall, json!({})).unwrap();
        encoder.emit(EventKind::Final, json!({})).unwrap();

        // Nobody reads, the second event cannot be delivered
        let log = tokio::time::timeout(
            Duration::from_secs(2),
            encoder.finish(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_late_subscriber_reads_tail_from_log() {
        let (mut encoder, mut stream) = channel("s1", 2, 3);
        for i in 0..6 {
            encoder.emit(EventKind::Thinking, json!({"i": i})).unwrap();
        }
        encoder.emit(EventKind::Final, json!({"verdict": "supported"})).unwrap();
        encoder.finish(Duration::from_millis(20)).await;

        let mut received = Vec::new();
        while let Some(event) = stream.next().await {
            received.push(event);
        }

        let seqs: Vec<u64> = received.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(received.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_dropped_encoder_emits_terminal_error() {
        let (mut encoder, stream) = channel("s1", 4, 4);
        encoder.emit(EventKind::ToolCall, json!({"tool": "ocr"})).unwrap();
        drop(encoder);

        let received: Vec<StreamEvent> = stream.into_stream().collect().await;
        assert_eq!(received.len(), 2);
        let last = &received[1];
        assert_eq!(last.kind, EventKind::Error);
        assert!(last.is_terminal());
        assert_eq!(last.payload["code"], "internal_error");
    }

    #[tokio::test]
    async fn test_replay_yields_archived_sequence() {
        let events: Vec<StreamEvent> = (1..=3)
            .map(|seq| StreamEvent {
                seq,
                kind: if seq == 3 { EventKind::Final } else { EventKind::ToolCall },
                payload: json!({}),
                timestamp: Utc::now(),
            })
            .collect();

        let mut stream = EventStream::replay("s1", events);
        assert_eq!(stream.next().await.unwrap().seq, 1);
        assert_eq!(stream.next().await.unwrap().seq, 2);
        assert_eq!(stream.next().await.unwrap().kind, EventKind::Final);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_sse_frame_and_terminal_detection() {
        let event = StreamEvent {
            seq: 7,
            kind: EventKind::Error,
            payload: json!({"code": "invalid_arguments", "terminal": false}),
            timestamp: Utc::now(),
        };
        assert!(!event.is_terminal());
        let frame = event.to_sse();
        assert!(frame.starts_with("id: 7\nevent: error\ndata: {"));
        assert!(frame.ends_with("\n\n"));
    }
}
