pub mod audio;
pub mod effects;
pub mod metrics;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use audio::AudioBackend;
use effects::{EffectRunner, SessionRuntime};
use metrics::{EndReason, MetricsCollector, MetricsSummary};
use settings::LiveSettings;
use state_machine::{reduce, Effect, Event, State};
use streaming::Transport;

/// Capacity of the session loop's event channel
const EVENT_CHANNEL_SIZE: usize = 256;

/// Observable session state for a UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub is_connected: bool,
    pub is_connecting: bool,
    /// Input level 0-100
    pub volume: f32,
    pub error: Option<String>,
}

/// Convert internal State to UiState
fn state_to_ui(state: &State) -> UiState {
    UiState {
        is_connected: state.is_connected(),
        is_connecting: state.is_connecting(),
        volume: state.volume(),
        error: state.error().map(str::to_string),
    }
}

fn emit_ui_state(ui: &watch::Sender<UiState>, state: &State) {
    let next = state_to_ui(state);
    ui.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("session loop has stopped")]
    LoopStopped,
}

/// Handle to the session loop. Exactly one session exists per handle.
pub struct LiveSessionHandle {
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    metrics: Arc<Mutex<MetricsCollector>>,
    /// Stops the loop regardless of channel capacity
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LiveSessionHandle {
    /// Spawn the session loop on the current tokio runtime.
    pub fn spawn(
        settings: LiveSettings,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_SIZE);
        let (ui_tx, ui_rx) = watch::channel(UiState::default());
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let cancel = CancellationToken::new();

        let runtime = SessionRuntime::new(settings, backend, transport, metrics.clone());
        let task = tokio::spawn(run_session_loop(
            rx,
            tx.clone(),
            Box::new(runtime),
            ui_tx,
            cancel.clone(),
        ));

        Self {
            tx,
            ui: ui_rx,
            metrics,
            cancel,
            task: Some(task),
        }
    }

    async fn send(&self, event: Event) -> Result<(), HandleError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| HandleError::LoopStopped)
    }

    /// Start a session. No-op while one is connecting or connected.
    pub async fn connect(&self) -> Result<(), HandleError> {
        self.send(Event::Connect).await
    }

    /// Tear down the session. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) -> Result<(), HandleError> {
        self.send(Event::Disconnect).await
    }

    pub fn ui_state(&self) -> UiState {
        self.ui.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.ui.clone()
    }

    pub async fn metrics(&self) -> MetricsSummary {
        self.metrics.lock().await.get_summary()
    }

    pub async fn metrics_history(&self) -> Vec<metrics::SessionMetrics> {
        self.metrics.lock().await.get_history()
    }

    /// Tear down and stop the loop, waiting for it to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Session loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for LiveSessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run the session loop until `cancel` fires
///
/// The loop keeps its own sender for effects, so the channel never closes
/// while it runs; cancellation is the only way out.
async fn run_session_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    mut effect_runner: Box<dyn EffectRunner>,
    ui: watch::Sender<UiState>,
    cancel: CancellationToken,
) {
    let mut state = State::default();

    emit_ui_state(&ui, &state);
    log::info!("Session loop started");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Exit requested, shutting down session loop");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            Event::AudioFrame { .. } | Event::ServerMessage { .. } | Event::PlaybackEnded { .. } => {
                log::trace!("Received stream event")
            }
            other => log::debug!("Received event: {:?}", other),
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        for eff in effects {
            match eff {
                Effect::EmitUi => emit_ui_state(&ui, &state),
                other => effect_runner.run(other, &tx).await,
            }
        }
    }

    effect_runner
        .run(
            Effect::Teardown {
                reason: EndReason::UserDisconnect,
                detail: None,
            },
            &tx,
        )
        .await;
    emit_ui_state(&ui, &State::default());

    log::info!("Session loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingRunner {
        teardowns: Arc<std::sync::Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl EffectRunner for RecordingRunner {
        async fn run(&mut self, effect: Effect, _tx: &mpsc::Sender<Event>) {
            if matches!(effect, Effect::Teardown { .. }) {
                *self.teardowns.lock().unwrap() += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_loop_exits_on_cancel_with_full_channel() {
        let (tx, rx) = mpsc::channel::<Event>(1);
        let (ui_tx, ui_rx) = watch::channel(UiState::default());
        let runner = RecordingRunner::default();
        let teardowns = runner.teardowns.clone();
        let cancel = CancellationToken::new();

        // Channel is full before the loop ever runs
        tx.try_send(Event::Connect).unwrap();
        assert!(tx.try_send(Event::Disconnect).is_err());

        cancel.cancel();
        let task = tokio::spawn(run_session_loop(
            rx,
            tx.clone(),
            Box::new(runner),
            ui_tx,
            cancel,
        ));

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(*teardowns.lock().unwrap(), 1);
        assert_eq!(*ui_rx.borrow(), UiState::default());
    }

    #[tokio::test]
    async fn test_loop_keeps_running_after_events() {
        let (tx, rx) = mpsc::channel::<Event>(8);
        let (ui_tx, ui_rx) = watch::channel(UiState::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session_loop(
            rx,
            tx.clone(),
            Box::new(RecordingRunner::default()),
            ui_tx,
            cancel.clone(),
        ));

        tx.send(Event::Connect).await.unwrap();
        let mut ui = ui_rx.clone();
        tokio::time::timeout(std::time::Duration::from_secs(1), ui.changed())
            .await
            .expect("no ui update")
            .unwrap();
        assert!(ui.borrow().is_connecting);
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_ui_state_serialization() {
        let ui = UiState {
            is_connected: true,
            is_connecting: false,
            volume: 12.5,
            error: None,
        };
        let json = serde_json::to_value(&ui).unwrap();
        assert_eq!(json["isConnected"], true);
        assert_eq!(json["isConnecting"], false);
        assert_eq!(json["volume"], 12.5);
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_state_to_ui() {
        let id = Uuid::new_v4();
        assert_eq!(state_to_ui(&State::default()), UiState::default());

        let ui = state_to_ui(&State::Connecting { session_id: id });
        assert!(ui.is_connecting && !ui.is_connected);

        let ui = state_to_ui(&State::Connected {
            session_id: id,
            volume: 30.0,
        });
        assert!(ui.is_connected && !ui.is_connecting);
        assert_eq!(ui.volume, 30.0);

        let ui = state_to_ui(&State::Disconnected {
            error: Some("boom".to_string()),
        });
        assert_eq!(ui.error.as_deref(), Some("boom"));
        assert_eq!(ui.volume, 0.0);
    }
}
