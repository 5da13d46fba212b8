//! Dedicated thread owning a cpal stream
//!
//! cpal streams are not `Send` on every platform, so each one is built and
//! dropped on its own thread. The owner talks to it through a command channel.

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::StreamTrait;

use super::AudioError;

enum StreamCommand {
    Play,
    Stop,
}

/// Handle to a device thread. Dropping it stops the stream.
pub(crate) struct DeviceThread {
    name: &'static str,
    control: Option<mpsc::Sender<StreamCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Spawn a thread, build the stream on it and wait for the result.
    ///
    /// When `autoplay` is set the stream starts immediately; otherwise it stays
    /// paused until [`DeviceThread::play`].
    pub(crate) fn spawn<F>(name: &'static str, build: F, autoplay: bool) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (control_tx, control_rx) = mpsc::channel::<StreamCommand>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if autoplay {
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                            "Failed to start stream: {}",
                            e
                        ))));
                        return;
                    }
                }
                let _ = ready_tx.send(Ok(()));

                // Park until told to stop or until the owner goes away
                while let Ok(command) = control_rx.recv() {
                    match command {
                        StreamCommand::Play => {
                            if let Err(e) = stream.play() {
                                log::error!("{}: failed to start stream: {}", name, e);
                            }
                        }
                        StreamCommand::Stop => break,
                    }
                }

                if let Err(e) = stream.pause() {
                    log::debug!("{}: pause on shutdown failed: {}", name, e);
                }
                drop(stream);
                log::debug!("{}: stream released", name);
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                name,
                control: Some(control_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamCreationFailed(format!(
                    "{} exited before the stream was ready",
                    name
                )))
            }
        }
    }

    pub(crate) fn play(&self) -> Result<(), AudioError> {
        self.control
            .as_ref()
            .ok_or(AudioError::Closed)?
            .send(StreamCommand::Play)
            .map_err(|_| AudioError::Closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.control.is_none()
    }

    /// Stop the stream and join the thread. Safe to call more than once.
    pub(crate) fn close(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(StreamCommand::Stop);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("{}: device thread panicked", self.name);
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.close();
    }
}
