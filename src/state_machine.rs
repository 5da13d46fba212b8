//! Session state machine
//!
//! This module implements the session lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! ```text
//! Disconnected --Connect--> Connecting --SessionOpened--> Connected
//!      ^                        |                             |
//!      +------ ConnectFailed / Disconnect / TransportClosed / TransportFailed
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::audio::{AudioError, BufferId, DecodeError};
use crate::effects::LiveResources;
use crate::metrics::EndReason;
use crate::streaming::{self, TransportError};

/// Shown when acquiring devices or opening the transport fails
pub const CONNECT_FAILED_MESSAGE: &str = "Failed to access microphone or connect to API.";

/// Shown when an open transport reports an error
pub const CONNECTION_ERROR_MESSAGE: &str = "Connection error occurred.";

/// Controller-level failure. The `Display` text is the raw detail for logs;
/// [`SessionError::user_message`] is what the UI shows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("microphone permission denied: {0}")]
    Permission(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("transport connect failed: {0}")]
    TransportConnect(String),
    #[error("transport error: {0}")]
    TransportRuntime(String),
    #[error("audio decode error: {0}")]
    Decode(String),
}

impl SessionError {
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::Permission(_)
            | SessionError::Device(_)
            | SessionError::TransportConnect(_) => CONNECT_FAILED_MESSAGE,
            SessionError::TransportRuntime(_) | SessionError::Decode(_) => CONNECTION_ERROR_MESSAGE,
        }
    }
}

impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        if err.is_permission() {
            SessionError::Permission(err.to_string())
        } else {
            SessionError::Device(err.to_string())
        }
    }
}

impl From<DecodeError> for SessionError {
    fn from(err: DecodeError) -> Self {
        SessionError::Decode(err.to_string())
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::TransportConnect(err.to_string())
    }
}

/// Internal state of the session lifecycle.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Disconnected {
        /// User-facing message from the last failure, if any
        error: Option<String>,
    },
    Connecting {
        session_id: Uuid,
    },
    Connected {
        session_id: Uuid,
        /// Input level of the most recent frame (0-100)
        volume: f32,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Disconnected { error: None }
    }
}

impl State {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Disconnected { .. } => None,
            State::Connecting { session_id } | State::Connected { session_id, .. } => {
                Some(*session_id)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, State::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, State::Connecting { .. })
    }

    pub fn volume(&self) -> f32 {
        match self {
            State::Connected { volume, .. } => *volume,
            _ => 0.0,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            State::Disconnected { error } => error.as_deref(),
            _ => None,
        }
    }
}

/// Events that can trigger state transitions.
/// These are sent from the public handle, the connect task, device callbacks
/// and the transport pump. Asynchronous sources always carry their session id.
#[derive(Debug)]
pub enum Event {
    /// User requested a session
    Connect,
    /// User requested teardown
    Disconnect,

    /// Connect task finished acquiring everything; the transport is open
    SessionOpened {
        id: Uuid,
        resources: LiveResources,
    },
    ConnectFailed {
        id: Uuid,
        error: SessionError,
    },

    /// One captured frame with its input level
    AudioFrame {
        id: Uuid,
        samples: Vec<f32>,
        volume: f32,
    },
    /// A buffer played to its end
    PlaybackEnded {
        id: Uuid,
        buffer: BufferId,
    },

    ServerMessage {
        id: Uuid,
        message: streaming::ServerMessage,
    },
    TransportClosed {
        id: Uuid,
        reason: Option<String>,
    },
    TransportFailed {
        id: Uuid,
        error: SessionError,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug)]
pub enum Effect {
    /// Acquire devices and open the transport in a background task
    OpenSession { id: Uuid },
    /// Take ownership of the opened resources and start streaming
    InstallSession { id: Uuid, resources: LiveResources },
    /// Resources arrived for a session that is no longer current
    ReleaseStale { id: Uuid, resources: LiveResources },
    SendFrame { id: Uuid, samples: Vec<f32> },
    HandleServerMessage {
        id: Uuid,
        message: streaming::ServerMessage,
    },
    BufferEnded { id: Uuid, buffer: BufferId },
    /// Release every resource. Safe when nothing is held.
    Teardown {
        reason: EndReason,
        detail: Option<String>,
    },
    /// Signal to publish the UI state
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Always emit EmitUi after visible state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Connect / Disconnect
        // -----------------
        (Disconnected { .. }, Connect) => {
            let id = Uuid::new_v4();
            (
                Connecting { session_id: id },
                vec![OpenSession { id }, EmitUi],
            )
        }
        // At most one session connecting or connected
        (Connecting { .. } | Connected { .. }, Connect) => (state.clone(), vec![]),

        // Disconnect is total: always tear down, even with nothing held
        (Disconnected { error }, Disconnect) => (
            Disconnected {
                error: error.clone(),
            },
            vec![
                Teardown {
                    reason: EndReason::UserDisconnect,
                    detail: None,
                },
                EmitUi,
            ],
        ),
        (_, Disconnect) => (
            Disconnected { error: None },
            vec![
                Teardown {
                    reason: EndReason::UserDisconnect,
                    detail: None,
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { session_id }, SessionOpened { id, resources }) if *session_id == id => (
            Connected {
                session_id: id,
                volume: 0.0,
            },
            vec![InstallSession { id, resources }, EmitUi],
        ),
        // Late open for a session that was torn down or replaced
        (_, SessionOpened { id, resources }) => (state.clone(), vec![ReleaseStale { id, resources }]),

        (Connecting { .. } | Connected { .. }, ConnectFailed { id, error }) if is_current(id) => (
            Disconnected {
                error: Some(error.user_message().to_string()),
            },
            vec![
                Teardown {
                    reason: EndReason::ConnectFailed,
                    detail: Some(error.to_string()),
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Connected
        // -----------------
        (Connected { session_id, .. }, AudioFrame { id, samples, volume }) if *session_id == id => (
            Connected {
                session_id: id,
                volume,
            },
            vec![SendFrame { id, samples }, EmitUi],
        ),
        (Connected { session_id, .. }, Event::ServerMessage { id, message }) if *session_id == id => {
            (state.clone(), vec![HandleServerMessage { id, message }])
        }
        (Connected { session_id, .. }, PlaybackEnded { id, buffer }) if *session_id == id => {
            (state.clone(), vec![BufferEnded { id, buffer }])
        }

        // Remote close ends the session without an error
        (Connecting { .. } | Connected { .. }, TransportClosed { id, reason }) if is_current(id) => (
            Disconnected { error: None },
            vec![
                Teardown {
                    reason: EndReason::RemoteClosed,
                    detail: reason,
                },
                EmitUi,
            ],
        ),
        (Connecting { .. } | Connected { .. }, TransportFailed { id, error }) if is_current(id) => (
            Disconnected {
                error: Some(CONNECTION_ERROR_MESSAGE.to_string()),
            },
            vec![
                Teardown {
                    reason: EndReason::TransportError,
                    detail: Some(error.to_string()),
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Stale or out-of-state events (drop silently)
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connecting() -> (Uuid, State) {
        let id = Uuid::new_v4();
        (id, State::Connecting { session_id: id })
    }

    fn connected() -> (Uuid, State) {
        let id = Uuid::new_v4();
        (
            id,
            State::Connected {
                session_id: id,
                volume: 0.0,
            },
        )
    }

    fn has_teardown(effects: &[Effect]) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Teardown { .. }))
    }

    #[test]
    fn connect_from_disconnected_opens_session() {
        let state = State::Disconnected {
            error: Some("old".to_string()),
        };
        let (next, effects) = reduce(&state, Event::Connect);

        let State::Connecting { session_id } = next else {
            panic!("expected Connecting, got {:?}", next);
        };
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::OpenSession { id } if *id == session_id)));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
        // Error is cleared on a new attempt
        assert_eq!(next_error(&state, Event::Connect), None);
    }

    fn next_error(state: &State, event: Event) -> Option<String> {
        reduce(state, event).0.error().map(str::to_string)
    }

    #[test]
    fn connect_while_connecting_is_noop() {
        let (_, state) = connecting();
        let (next, effects) = reduce(&state, Event::Connect);
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn connect_while_connected_is_noop() {
        let (_, state) = connected();
        let (next, effects) = reduce(&state, Event::Connect);
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn connect_failed_sets_generic_message_and_tears_down() {
        let (id, state) = connecting();
        let (next, effects) = reduce(
            &state,
            Event::ConnectFailed {
                id,
                error: SessionError::Permission("denied".to_string()),
            },
        );

        assert_eq!(next.error(), Some(CONNECT_FAILED_MESSAGE));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Teardown {
                reason: EndReason::ConnectFailed,
                detail: Some(_)
            }
        )));
    }

    #[test]
    fn stale_connect_failed_is_ignored() {
        let (_, state) = connecting();
        let (next, effects) = reduce(
            &state,
            Event::ConnectFailed {
                id: Uuid::new_v4(),
                error: SessionError::Device("gone".to_string()),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn disconnect_is_always_a_teardown() {
        for state in [State::default(), connecting().1, connected().1] {
            let (next, effects) = reduce(&state, Event::Disconnect);
            assert!(matches!(next, State::Disconnected { .. }));
            assert!(has_teardown(&effects));
            assert_eq!(next.volume(), 0.0);
        }
    }

    #[test]
    fn disconnect_keeps_previous_error() {
        let state = State::Disconnected {
            error: Some(CONNECTION_ERROR_MESSAGE.to_string()),
        };
        assert_eq!(
            next_error(&state, Event::Disconnect).as_deref(),
            Some(CONNECTION_ERROR_MESSAGE)
        );
    }

    #[test]
    fn frame_while_connected_is_sent_and_updates_volume() {
        let (id, state) = connected();
        let (next, effects) = reduce(
            &state,
            Event::AudioFrame {
                id,
                samples: vec![0.0; 4],
                volume: 42.0,
            },
        );

        assert_eq!(next.volume(), 42.0);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::SendFrame { samples, .. } if samples.len() == 4)));
    }

    #[test]
    fn frame_while_not_connected_is_dropped() {
        let (id, state) = connecting();
        let (next, effects) = reduce(
            &state,
            Event::AudioFrame {
                id,
                samples: vec![0.0; 4],
                volume: 10.0,
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());

        let (next, effects) = reduce(
            &State::default(),
            Event::AudioFrame {
                id,
                samples: vec![0.0; 4],
                volume: 10.0,
            },
        );
        assert_eq!(next, State::default());
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_frame_is_dropped() {
        let (_, state) = connected();
        let (next, effects) = reduce(
            &state,
            Event::AudioFrame {
                id: Uuid::new_v4(),
                samples: vec![0.5; 4],
                volume: 50.0,
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn server_message_is_handled_only_when_current() {
        let (id, state) = connected();
        let (_, effects) = reduce(
            &state,
            Event::ServerMessage {
                id,
                message: crate::streaming::ServerMessage::default(),
            },
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::HandleServerMessage { .. }]
        ));

        let (_, effects) = reduce(
            &state,
            Event::ServerMessage {
                id: Uuid::new_v4(),
                message: crate::streaming::ServerMessage::default(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn playback_ended_for_current_session_releases_buffer() {
        let (id, state) = connected();
        let (next, effects) = reduce(
            &state,
            Event::PlaybackEnded {
                id,
                buffer: BufferId(3),
            },
        );
        assert_eq!(next, state);
        assert!(matches!(
            effects.as_slice(),
            [Effect::BufferEnded { id: eid, buffer: BufferId(3) }] if *eid == id
        ));
    }

    #[test]
    fn stale_playback_ended_is_ignored() {
        let (_, state) = connected();
        let (next, effects) = reduce(
            &state,
            Event::PlaybackEnded {
                id: Uuid::new_v4(),
                buffer: BufferId(3),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());

        let (next, effects) = reduce(
            &State::default(),
            Event::PlaybackEnded {
                id: Uuid::new_v4(),
                buffer: BufferId(0),
            },
        );
        assert_eq!(next, State::default());
        assert!(effects.is_empty());
    }

    #[test]
    fn transport_close_tears_down_without_error() {
        let (id, state) = connected();
        let (next, effects) = reduce(
            &state,
            Event::TransportClosed {
                id,
                reason: Some("bye".to_string()),
            },
        );
        assert_eq!(next, State::Disconnected { error: None });
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Teardown {
                reason: EndReason::RemoteClosed,
                ..
            }
        )));
    }

    #[test]
    fn transport_error_tears_down_with_message() {
        let (id, state) = connected();
        let (next, effects) = reduce(
            &state,
            Event::TransportFailed {
                id,
                error: SessionError::TransportRuntime("reset".to_string()),
            },
        );
        assert_eq!(next.error(), Some(CONNECTION_ERROR_MESSAGE));
        assert!(has_teardown(&effects));
    }

    #[test]
    fn stale_transport_events_are_ignored() {
        let (_, state) = connected();
        let (next, effects) = reduce(
            &state,
            Event::TransportFailed {
                id: Uuid::new_v4(),
                error: SessionError::TransportRuntime("old".to_string()),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());

        let (next, effects) = reduce(
            &State::default(),
            Event::TransportClosed {
                id: Uuid::new_v4(),
                reason: None,
            },
        );
        assert_eq!(next, State::default());
        assert!(effects.is_empty());
    }

    #[test]
    fn user_messages() {
        assert_eq!(
            SessionError::Permission(String::new()).user_message(),
            CONNECT_FAILED_MESSAGE
        );
        assert_eq!(
            SessionError::Device(String::new()).user_message(),
            CONNECT_FAILED_MESSAGE
        );
        assert_eq!(
            SessionError::TransportConnect(String::new()).user_message(),
            CONNECT_FAILED_MESSAGE
        );
        assert_eq!(
            SessionError::TransportRuntime(String::new()).user_message(),
            CONNECTION_ERROR_MESSAGE
        );
    }

    #[test]
    fn audio_errors_map_to_session_errors() {
        let err: SessionError = AudioError::PermissionDenied("no".to_string()).into();
        assert!(matches!(err, SessionError::Permission(_)));

        let err: SessionError = AudioError::NoInputDevice.into();
        assert!(matches!(err, SessionError::Device(_)));

        let err: SessionError = TransportError::MissingApiKey.into();
        assert!(matches!(err, SessionError::TransportConnect(_)));
    }
}
