//! Rolling frame retention and the recording-session state machine.

use crate::frame::FrameRecord;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Insertion-ordered buffer of recent frames, oldest first.
///
/// While no recording session is active, frames older than the retention
/// window are evicted from the front before each insertion. While a session
/// is active the caller suspends eviction so the full event window (before,
/// during and after the detection) survives until the flush.
#[derive(Debug)]
pub struct FrameRingBuffer {
    frames: VecDeque<FrameRecord>,
    retention: Duration,
}

impl FrameRingBuffer {
    pub fn new(retention: Duration) -> Self {
        Self {
            frames: VecDeque::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Append a frame. Frames arrive from a single sequential capture loop,
    /// so insertion order is timestamp order; the invariant is checked in
    /// debug builds.
    pub fn push(&mut self, frame: FrameRecord) {
        debug_assert!(
            self.frames
                .back()
                .map(|last| last.captured_at <= frame.captured_at)
                .unwrap_or(true),
            "frames must be pushed in capture order"
        );
        trace!("Buffering frame {}", frame.seq);
        self.frames.push_back(frame);
    }

    /// Evict the prefix of frames whose age exceeds the retention window.
    ///
    /// Frames are time-ordered, so this stops at the first record still
    /// inside the window rather than scanning the whole buffer. A frame
    /// exactly at the window edge is retained; only strictly older frames
    /// are dropped. Returns the number of evicted frames.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.frames.front() {
            if front.is_older_than(now, self.retention) {
                self.frames.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        if evicted > 0 {
            trace!("Evicted {} expired frames", evicted);
        }
        evicted
    }

    /// Consume every buffered frame, oldest first, leaving the buffer empty.
    pub fn take_all(&mut self) -> Vec<FrameRecord> {
        self.frames.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        self.frames.iter()
    }
}

/// Recording-session state for one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
}

/// Tracks one continuous Active period between a detection event and its
/// flush. A session's age is bounded by a hard cap: once exceeded the
/// session must end and flush regardless of the current detection signal,
/// so no clip can grow without bound.
#[derive(Debug)]
pub struct RecordingSession {
    state: SessionState,
    started_at: Option<Instant>,
    cap: Duration,
}

impl RecordingSession {
    pub fn new(cap: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            started_at: None,
            cap,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Transition Idle -> Active, recording the session start time.
    /// Beginning an already-active session is a no-op.
    pub fn begin(&mut self, now: Instant) {
        if self.state == SessionState::Idle {
            debug!("Recording session started");
            self.state = SessionState::Active;
            self.started_at = Some(now);
        }
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
    }

    /// True once the session has outlived the hard cap.
    pub fn cap_exceeded(&self, now: Instant) -> bool {
        match (self.state, self.age(now)) {
            (SessionState::Active, Some(age)) => age > self.cap,
            _ => false,
        }
    }

    /// Transition back to Idle. The caller flushes the buffer.
    pub fn end(&mut self) {
        if self.state == SessionState::Active {
            debug!("Recording session ended");
        }
        self.state = SessionState::Idle;
        self.started_at = None;
    }
}
