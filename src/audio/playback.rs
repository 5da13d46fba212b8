//! Gapless playback scheduling with barge-in interruption
//!
//! Buffers are queued back-to-back on the output clock in arrival order. The
//! scheduler tracks every buffer that has been started but not yet finished
//! so an interruption can silence all of them at once.

use std::collections::BTreeMap;
use std::fmt;

use super::pcm::PlaybackBuffer;
use super::OutputDevice;

/// Identifier of one scheduled buffer, unique within a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Placement of a buffer on the output clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    /// Start time in seconds on the output clock
    pub start: f64,
    /// End time in seconds on the output clock
    pub end: f64,
}

impl ScheduledBuffer {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Owns the output device and the set of active buffers.
pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    next_start_time: f64,
    active: BTreeMap<BufferId, ScheduledBuffer>,
    next_id: u64,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputDevice>) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Current output clock time in seconds
    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    /// Time at which the next buffer would start if nothing else is queued
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of buffers scheduled or playing
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: BufferId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue a buffer right after everything already scheduled.
    ///
    /// Returns `None` once the scheduler has been torn down.
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> Option<ScheduledBuffer> {
        if self.closed {
            log::debug!("Playback: schedule after teardown ignored");
            return None;
        }

        let now = self.output.current_time();
        let start = self.next_start_time.max(now);
        let duration = buffer.duration();

        let id = BufferId(self.next_id);
        self.next_id += 1;

        let scheduled = ScheduledBuffer {
            id,
            start,
            end: start + duration,
        };

        self.output.start(id, buffer, start);
        self.active.insert(id, scheduled);
        self.next_start_time = scheduled.end;

        log::trace!(
            "Playback: buffer {} at {:.3}s for {:.3}s (now {:.3}s, {} active)",
            id,
            start,
            duration,
            now,
            self.active.len()
        );

        Some(scheduled)
    }

    /// Stop everything immediately and restart the schedule at "now".
    ///
    /// Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            self.output.stop(id);
        }
        self.next_start_time = 0.0;
        stopped
    }

    /// Completion notification for a buffer that played to its end.
    pub fn on_buffer_ended(&mut self, id: BufferId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Interrupt and release the output device. Idempotent.
    pub fn teardown(&mut self) {
        let stopped = self.interrupt();
        if !self.closed {
            self.closed = true;
            self.output.close();
            log::debug!("Playback: torn down ({} buffers stopped)", stopped);
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}
