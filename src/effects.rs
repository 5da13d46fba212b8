//! Effect runner for live sessions
//!
//! This module executes effects produced by the state machine and owns every
//! resource of the current session: the pending connect task, the playback
//! scheduler, the microphone and the transport connection.
//!
//! Effects run in the order the reducer produced them. Only `OpenSession`
//! suspends for long (device and network acquisition), so it runs in a
//! background task that reports back with `SessionOpened` or `ConnectFailed`.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::pcm::{self, parse_pcm_rate};
use crate::audio::{
    frame_volume, AudioBackend, EndedNotifier, FrameSink, InputDevice, PlaybackScheduler,
};
use crate::metrics::{EndReason, MetricsCollector};
use crate::settings::LiveSettings;
use crate::state_machine::{Effect, Event, SessionError};
use crate::streaming::{ServerMessage, Transport, TransportConnection, TransportEvent};

/// Trait for running effects.
/// Completion events are sent back via the provided channel.
#[async_trait]
pub trait EffectRunner: Send + 'static {
    async fn run(&mut self, effect: Effect, tx: &mpsc::Sender<Event>);
}

/// Everything acquired by a successful connect.
///
/// Dropping it releases each resource exactly once: transport first, then
/// the microphone, then playback.
pub struct LiveResources {
    pub transport: Box<dyn TransportConnection>,
    pub capture: Box<dyn InputDevice>,
    pub playback: PlaybackScheduler,
}

impl LiveResources {
    fn release(&mut self) {
        self.transport.close();
        self.capture.close();
        self.playback.teardown();
    }
}

impl Drop for LiveResources {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LiveResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveResources")
            .field("active_buffers", &self.playback.active_len())
            .field("playback_closed", &self.playback.is_closed())
            .finish_non_exhaustive()
    }
}

struct PendingConnect {
    id: Uuid,
    task: JoinHandle<()>,
}

struct ActiveSession {
    id: Uuid,
    resources: LiveResources,
    /// Forwards transport events into the session loop
    pump: JoinHandle<()>,
}

impl ActiveSession {
    fn close(mut self) {
        self.resources.transport.close();
        self.resources.capture.close();
        self.pump.abort();
        let stopped = self.resources.playback.active_len();
        self.resources.playback.teardown();
        log::info!(
            "Session {}: released transport, microphone and playback ({} buffers stopped)",
            self.id,
            stopped
        );
    }
}

/// Real effect runner backed by an audio backend and a transport.
pub struct SessionRuntime {
    settings: LiveSettings,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    metrics: Arc<Mutex<MetricsCollector>>,
    pending: Option<PendingConnect>,
    active: Option<ActiveSession>,
}

impl SessionRuntime {
    pub fn new(
        settings: LiveSettings,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Self {
        Self {
            settings,
            backend,
            transport,
            metrics,
            pending: None,
            active: None,
        }
    }

    fn active_for(&mut self, id: Uuid) -> Option<&mut ActiveSession> {
        self.active.as_mut().filter(|session| session.id == id)
    }

    async fn open_session(&mut self, id: Uuid, tx: &mpsc::Sender<Event>) {
        if let Some(old) = self.pending.take() {
            log::warn!("Session {}: aborting superseded connect", old.id);
            old.task.abort();
        }

        self.metrics.lock().await.start_session(id);
        log::info!("Session {}: connecting", id);

        let task = tokio::spawn(connect_task(
            id,
            self.settings.clone(),
            self.backend.clone(),
            self.transport.clone(),
            tx.clone(),
        ));
        self.pending = Some(PendingConnect { id, task });
    }

    async fn install_session(
        &mut self,
        id: Uuid,
        mut resources: LiveResources,
        tx: &mpsc::Sender<Event>,
    ) {
        if self.pending.as_ref().is_some_and(|p| p.id == id) {
            self.pending = None;
        }
        if let Some(old) = self.active.take() {
            log::warn!("Session {}: replacing leftover session {}", id, old.id);
            release_blocking(move || old.close()).await;
        }

        let events = resources.transport.take_events();
        let pump = tokio::spawn(pump_transport(id, events, tx.clone()));

        // Frames only flow once the transport is open
        if let Err(e) = resources.capture.start() {
            log::error!("Session {}: failed to start microphone: {}", id, e);
            post(
                tx,
                Event::ConnectFailed {
                    id,
                    error: e.into(),
                },
            );
        }

        self.metrics.lock().await.session_opened();
        log::info!("Session {}: connected, streaming audio", id);

        self.active = Some(ActiveSession {
            id,
            resources,
            pump,
        });
    }

    async fn send_frame(&mut self, id: Uuid, samples: Vec<f32>) {
        let sample_rate = self.settings.input_sample_rate;
        let Some(session) = self.active_for(id) else {
            log::trace!("Session {}: no active session, frame dropped", id);
            return;
        };

        let chunk = pcm::encode(&samples, sample_rate);
        match session.resources.transport.send_audio(chunk) {
            Ok(()) => self.metrics.lock().await.frame_sent(samples.len() * 2),
            // A failing transport reports its own close/error event
            Err(e) => log::debug!("Session {}: frame not sent: {}", id, e),
        }
    }

    async fn handle_server_message(&mut self, id: Uuid, message: ServerMessage) {
        let fallback_rate = self.settings.output_sample_rate;
        let metrics = self.metrics.clone();
        let Some(session) = self.active_for(id) else {
            return;
        };
        let mut metrics = metrics.lock().await;
        let playback = &mut session.resources.playback;

        for blob in message.audio_payloads() {
            let rate = parse_pcm_rate(&blob.mime_type).unwrap_or(fallback_rate);
            let decoded =
                pcm::decode(&blob.data).and_then(|bytes| pcm::decode_audio_data(&bytes, rate, 1));

            match decoded {
                Ok(buffer) => {
                    let duration = buffer.duration();
                    if playback.schedule(buffer).is_some() {
                        metrics.buffer_scheduled(duration);
                    }
                }
                Err(e) => {
                    let error = SessionError::from(e);
                    log::warn!("Session {}: dropping audio payload: {}", id, error);
                    metrics.decode_failed(error.to_string());
                }
            }
        }

        if message.is_interrupted() {
            let stopped = playback.interrupt();
            log::info!("Session {}: model interrupted, {} buffers stopped", id, stopped);
            metrics.interrupted(stopped);
        }

        if message.is_turn_complete() {
            log::debug!("Session {}: model turn complete", id);
        }
    }

    async fn teardown(&mut self, reason: EndReason, detail: Option<String>) {
        if let Some(pending) = self.pending.take() {
            // Dropping the task drops whatever it had acquired so far
            pending.task.abort();
            log::info!("Session {}: connect aborted", pending.id);
        }

        match self.active.take() {
            Some(session) => release_blocking(move || session.close()).await,
            None => log::debug!("Teardown: no active session"),
        }

        if let Some(detail) = &detail {
            log::warn!("Session ended ({:?}): {}", reason, detail);
        }
        self.metrics.lock().await.session_ended(reason, detail);
    }
}

#[async_trait]
impl EffectRunner for SessionRuntime {
    async fn run(&mut self, effect: Effect, tx: &mpsc::Sender<Event>) {
        match effect {
            Effect::OpenSession { id } => self.open_session(id, tx).await,
            Effect::InstallSession { id, resources } => {
                self.install_session(id, resources, tx).await
            }
            Effect::ReleaseStale { id, resources } => {
                log::info!("Session {}: opened after teardown, releasing", id);
                release_blocking(move || drop(resources)).await;
            }
            Effect::SendFrame { id, samples } => self.send_frame(id, samples).await,
            Effect::HandleServerMessage { id, message } => {
                self.handle_server_message(id, message).await
            }
            Effect::BufferEnded { id, buffer } => {
                if let Some(session) = self.active_for(id) {
                    session.resources.playback.on_buffer_ended(buffer);
                }
            }
            Effect::Teardown { reason, detail } => self.teardown(reason, detail).await,
            // Handled by the session loop
            Effect::EmitUi => {}
        }
    }
}

/// Closing devices joins their threads, so it runs on the blocking pool
async fn release_blocking(release: impl FnOnce() + Send + 'static) {
    if let Err(e) = tokio::task::spawn_blocking(release).await {
        log::error!("Resource release failed: {}", e);
    }
}

/// Post from a context that must not wait on the session loop
fn post(tx: &mpsc::Sender<Event>, event: Event) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Session loop busy, dropping {}", event_name(&event));
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::debug!("Session loop closed, dropping event");
        }
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::AudioFrame { .. } => "audio frame",
        Event::PlaybackEnded { .. } => "playback ended",
        Event::ConnectFailed { .. } => "connect failure",
        _ => "event",
    }
}

/// Acquire output, input and transport in that order and report back.
async fn connect_task(
    id: Uuid,
    settings: LiveSettings,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    tx: mpsc::Sender<Event>,
) {
    let event = match acquire(id, &settings, backend, transport, &tx).await {
        Ok(resources) => Event::SessionOpened { id, resources },
        Err(error) => {
            log::error!("Session {}: connect failed: {}", id, error);
            Event::ConnectFailed { id, error }
        }
    };

    if tx.send(event).await.is_err() {
        log::debug!("Session {}: loop gone, dropping connect result", id);
    }
}

async fn acquire(
    id: Uuid,
    settings: &LiveSettings,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    tx: &mpsc::Sender<Event>,
) -> Result<LiveResources, SessionError> {
    let ended_tx = tx.clone();
    let ended: EndedNotifier = Arc::new(move |buffer| {
        post(&ended_tx, Event::PlaybackEnded { id, buffer });
    });

    // Device opening blocks on the device thread handshake
    let output_backend = backend.clone();
    let output_rate = settings.output_sample_rate;
    let output =
        tokio::task::spawn_blocking(move || output_backend.open_output(output_rate, ended))
            .await
            .map_err(|e| SessionError::Device(e.to_string()))??;
    let playback = PlaybackScheduler::new(output);
    log::debug!("Session {}: output device ready", id);

    let sink = frame_sink(id, settings.volume_gain, tx.clone());
    let capture_config = settings.capture_config();
    let capture = tokio::task::spawn_blocking(move || backend.open_input(capture_config, sink))
        .await
        .map_err(|e| SessionError::Device(e.to_string()))??;
    log::debug!("Session {}: microphone ready", id);

    let connection = transport.connect(&settings.session_config()).await?;

    Ok(LiveResources {
        transport: connection,
        capture,
        playback,
    })
}

/// Called on the capture thread for every complete frame
fn frame_sink(id: Uuid, gain: f32, tx: mpsc::Sender<Event>) -> FrameSink {
    Box::new(move |samples: Vec<f32>| {
        let volume = frame_volume(&samples, gain);
        post(
            &tx,
            Event::AudioFrame {
                id,
                samples,
                volume,
            },
        );
    })
}

/// Forward transport events for one session until it closes
async fn pump_transport(
    id: Uuid,
    events: Option<mpsc::Receiver<TransportEvent>>,
    tx: mpsc::Sender<Event>,
) {
    let Some(mut events) = events else {
        let error = SessionError::TransportRuntime("transport event stream unavailable".into());
        let _ = tx.send(Event::TransportFailed { id, error }).await;
        return;
    };

    while let Some(event) = events.recv().await {
        let (event, terminal) = match event {
            TransportEvent::Message(message) => (Event::ServerMessage { id, message }, false),
            TransportEvent::Closed { reason } => (Event::TransportClosed { id, reason }, true),
            TransportEvent::Error(detail) => (
                Event::TransportFailed {
                    id,
                    error: SessionError::TransportRuntime(detail),
                },
                true,
            ),
        };

        if tx.send(event).await.is_err() || terminal {
            return;
        }
    }

    // Sender dropped without a terminal event
    let _ = tx.send(Event::TransportClosed { id, reason: None }).await;
}
