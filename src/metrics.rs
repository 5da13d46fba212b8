//! Metrics collection for live sessions
//!
//! Tracks connect latency, audio volume in both directions, interruptions and
//! error history per session. Used for diagnostics only.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The user disconnected (including disconnect during connect)
    UserDisconnect,
    /// Device or transport acquisition failed
    ConnectFailed,
    /// The remote side closed the session
    RemoteClosed,
    /// The transport reported an error mid-session
    TransportError,
}

/// Metrics for a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    /// Unix timestamp when connect was requested (seconds)
    pub started_at: u64,
    /// Time from connect request to session open, if it opened
    pub connect_duration_ms: Option<u64>,
    /// Total lifetime from connect request to teardown
    pub total_duration_ms: u64,
    /// Frames handed to the transport
    pub frames_sent: u64,
    /// Encoded PCM bytes handed to the transport (before base64)
    pub bytes_sent: u64,
    pub buffers_scheduled: u64,
    /// Seconds of model audio scheduled for playback
    pub audio_received_secs: f64,
    pub interruptions: u64,
    pub decode_errors: u64,
    pub end_reason: EndReason,
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    /// Sessions that reached the connected state
    pub opened_sessions: u64,
    pub failed_sessions: u64,
    /// Average connect latency (ms) across opened sessions in history
    pub avg_connect_ms: u64,
    pub total_frames_sent: u64,
    pub total_audio_received_secs: f64,
    pub total_interruptions: u64,
    pub total_decode_errors: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "connect", "transport", "decode")
    pub error_type: String,
    /// Raw error detail (never shown to the user)
    pub message: String,
    /// Associated session ID, if applicable
    pub session_id: Option<String>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    connect_duration: Option<Duration>,
    frames_sent: u64,
    bytes_sent: u64,
    buffers_scheduled: u64,
    audio_received_secs: f64,
    interruptions: u64,
    decode_errors: u64,
}

impl SessionInProgress {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            connect_duration: None,
            frames_sent: 0,
            bytes_sent: 0,
            buffers_scheduled: 0,
            audio_received_secs: 0.0,
            interruptions: 0,
            decode_errors: 0,
        }
    }

    fn finish(self, end_reason: EndReason, error_message: Option<String>) -> SessionMetrics {
        SessionMetrics {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            connect_duration_ms: self.connect_duration.map(|d| d.as_millis() as u64),
            total_duration_ms: self.started_at.elapsed().as_millis() as u64,
            frames_sent: self.frames_sent,
            bytes_sent: self.bytes_sent,
            buffers_scheduled: self.buffers_scheduled,
            audio_received_secs: self.audio_received_secs,
            interruptions: self.interruptions,
            decode_errors: self.decode_errors,
            end_reason,
            error_message,
        }
    }
}

/// Collects and stores metrics for live sessions
pub struct MetricsCollector {
    /// Finished sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// Errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
    opened_sessions: u64,
    failed_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
            opened_sessions: 0,
            failed_sessions: 0,
        }
    }

    /// Start tracking a new session
    ///
    /// A session still in progress is closed out as a user disconnect.
    pub fn start_session(&mut self, session_id: Uuid) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: closing in-progress session {} to start {}",
                old.session_id,
                session_id
            );
            self.add_to_history(old.finish(EndReason::UserDisconnect, None));
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.current = Some(SessionInProgress::new(session_id));
        self.total_sessions += 1;
    }

    /// Mark the current session as open (transport ready)
    pub fn session_opened(&mut self) {
        if let Some(ref mut session) = self.current {
            let elapsed = session.started_at.elapsed();
            session.connect_duration = Some(elapsed);
            self.opened_sessions += 1;
            log::info!(
                "Metrics: session {} opened after {}ms",
                session.session_id,
                elapsed.as_millis()
            );
        }
    }

    pub fn frame_sent(&mut self, pcm_bytes: usize) {
        if let Some(ref mut session) = self.current {
            session.frames_sent += 1;
            session.bytes_sent += pcm_bytes as u64;
        }
    }

    pub fn buffer_scheduled(&mut self, duration_secs: f64) {
        if let Some(ref mut session) = self.current {
            session.buffers_scheduled += 1;
            session.audio_received_secs += duration_secs;
        }
    }

    pub fn interrupted(&mut self, buffers_stopped: usize) {
        if let Some(ref mut session) = self.current {
            session.interruptions += 1;
            log::debug!(
                "Metrics: interruption in session {} ({} buffers stopped)",
                session.session_id,
                buffers_stopped
            );
        }
    }

    pub fn decode_failed(&mut self, detail: String) {
        let session_id = self.current.as_mut().map(|session| {
            session.decode_errors += 1;
            session.session_id.to_string()
        });
        self.record_error("decode".to_string(), detail, session_id);
    }

    /// Close out the current session
    pub fn session_ended(&mut self, reason: EndReason, error: Option<String>) {
        let Some(session) = self.current.take() else {
            return;
        };
        let session_id = session.session_id.to_string();
        let metrics = session.finish(reason, error.clone());

        log::info!(
            "Metrics: session {} ended ({:?}) after {}ms - {} frames sent, {:.1}s audio received, {} interruptions",
            metrics.session_id,
            reason,
            metrics.total_duration_ms,
            metrics.frames_sent,
            metrics.audio_received_secs,
            metrics.interruptions
        );

        if matches!(reason, EndReason::ConnectFailed | EndReason::TransportError) {
            self.failed_sessions += 1;
        }
        self.add_to_history(metrics);

        if let Some(message) = error {
            let error_type = match reason {
                EndReason::ConnectFailed => "connect",
                _ => "transport",
            };
            self.record_error(error_type.to_string(), message, Some(session_id));
        }
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(&mut self, error_type: String, message: String, session_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let connect_times: Vec<u64> = self
            .history
            .iter()
            .filter_map(|s| s.connect_duration_ms)
            .collect();
        let avg_connect_ms = if connect_times.is_empty() {
            0
        } else {
            connect_times.iter().sum::<u64>() / connect_times.len() as u64
        };

        let finished = self.history.iter();
        let current = self.current.as_ref();

        MetricsSummary {
            total_sessions: self.total_sessions,
            opened_sessions: self.opened_sessions,
            failed_sessions: self.failed_sessions,
            avg_connect_ms,
            total_frames_sent: finished.clone().map(|s| s.frames_sent).sum::<u64>()
                + current.map(|s| s.frames_sent).unwrap_or(0),
            total_audio_received_secs: finished.clone().map(|s| s.audio_received_secs).sum::<f64>()
                + current.map(|s| s.audio_received_secs).unwrap_or(0.0),
            total_interruptions: finished.clone().map(|s| s.interruptions).sum::<u64>()
                + current.map(|s| s.interruptions).unwrap_or(0),
            total_decode_errors: finished.map(|s| s.decode_errors).sum::<u64>()
                + current.map(|s| s.decode_errors).unwrap_or(0),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished sessions (newest first)
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.current
            .as_ref()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
