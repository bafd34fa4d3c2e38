//! The per-camera capture pipeline: frame acquisition, detection gating,
//! live-stream publishing, the ring buffer and the recording session.

use crate::buffer::{FrameRingBuffer, RecordingSession};
use crate::config::SentrycamConfig;
use crate::detector::DetectorSet;
use crate::error::{Result, SentrycamError};
use crate::frame::FrameRecord;
use crate::mailbox::MailboxSender;
use crate::storage::{ClipStore, StreamPublisher};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The camera device seam. Opening the device and decoding frames happen
/// behind this trait; the capture loop only awaits the next frame.
///
/// Returning an error, or a frame with no data, is the device-failure
/// condition and is fatal to the capture service.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<FrameRecord>;
}

/// Frame source used when no real capture backend is wired up: emits a
/// synthetic frame at a fixed rate so the whole pipeline (buffering,
/// sessions, streaming) runs end to end without camera hardware.
pub struct TestPatternSource {
    period: Duration,
    interval: Option<tokio::time::Interval>,
    seq: u64,
    frame_len: usize,
}

impl TestPatternSource {
    pub fn new(fps: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / fps.max(1),
            // Created lazily: the source is constructed before the runtime
            // exists.
            interval: None,
            seq: 0,
            frame_len: 4096,
        }
    }
}

#[async_trait]
impl FrameSource for TestPatternSource {
    async fn next_frame(&mut self) -> Result<FrameRecord> {
        let period = self.period;
        let interval = self
            .interval
            .get_or_insert_with(|| tokio::time::interval(period));
        interval.tick().await;

        let seq = self.seq;
        self.seq += 1;
        Ok(FrameRecord::new(
            seq,
            std::time::Instant::now(),
            vec![(seq % 251) as u8; self.frame_len],
        ))
    }
}

/// One camera's capture state, driven one cycle at a time by the service
/// event loop in `daemon.rs`.
pub struct CameraWorker {
    index: u32,
    source: Box<dyn FrameSource>,
    detectors: DetectorSet,
    buffer: FrameRingBuffer,
    session: RecordingSession,
    clips: ClipStore,
    stream: StreamPublisher,
    mailbox: MailboxSender,
    livestream_active: bool,
    frames_seen: u64,
}

impl CameraWorker {
    /// Build the worker for one camera, creating its output and stream
    /// directories. Directory creation failure is fatal to construction
    /// and mirrored to the GUI before the error propagates.
    pub fn new(
        config: &SentrycamConfig,
        source: Box<dyn FrameSource>,
        detectors: DetectorSet,
    ) -> Result<Self> {
        let index = config.camera.index;
        let mailbox = MailboxSender::new(&config.service.mailbox_name);

        let clip_dir = config.clip_dir(index);
        let clips = ClipStore::new(&clip_dir).inspect_err(|_| {
            mailbox.send(&format!(
                "sentrycam could not create {}",
                clip_dir.display()
            ));
        })?;

        let stream_dir = config.stream_dir(index);
        let stream = StreamPublisher::new(&stream_dir).inspect_err(|_| {
            mailbox.send("sentrycam could not create the live stream.");
        })?;

        info!("Camera {} pipeline constructed", index);
        Ok(Self {
            index,
            source,
            detectors,
            buffer: FrameRingBuffer::new(Duration::from_secs(config.buffer.retention_seconds)),
            session: RecordingSession::new(Duration::from_secs(config.buffer.session_cap_seconds)),
            clips,
            stream,
            mailbox,
            livestream_active: false,
            frames_seen: 0,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_active()
    }

    /// Flip live-stream publishing; driven by the consumer attach/detach
    /// notifications. Recording is unaffected either way.
    pub fn set_livestream(&mut self, active: bool) {
        if self.livestream_active != active {
            info!(
                "Live stream {}",
                if active { "consumer attached" } else { "consumer detached" }
            );
        }
        self.livestream_active = active;
    }

    /// Run one capture cycle: acquire a frame and feed it through the
    /// pipeline. Any error returned here is unrecoverable and sends the
    /// service down its termination path.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let frame = self.source.next_frame().await.inspect_err(|e| {
            self.mailbox.send("sentrycam encountered an error.");
            error!("Frame acquisition failed on camera {}: {}", self.index, e);
        })?;

        if frame.is_empty() {
            self.mailbox.send("sentrycam encountered an error.");
            error!("Corrupt frame on camera {}", self.index);
            return Err(SentrycamError::device(format!(
                "corrupt frame on camera {}",
                self.index
            )));
        }

        self.observe(frame)
    }

    /// Feed one already-acquired frame through the pipeline. Split from
    /// `run_cycle` so tests can drive the state machine with fabricated
    /// timestamps.
    ///
    /// Cycle order is fixed: detection, stream publish, session
    /// transition, eviction, append.
    pub fn observe(&mut self, frame: FrameRecord) -> Result<()> {
        let now = frame.captured_at;
        let detection_signal = self.detectors.signal(&frame);

        if self.livestream_active {
            // Losing one stream frame only degrades the live view; the
            // viewer tolerates gaps.
            if let Err(e) = self.stream.publish(&frame) {
                warn!("Could not publish stream frame: {}", e);
            }
        }

        if detection_signal && !self.session.is_active() {
            info!("Detection event on camera {}", self.index);
            self.session.begin(now);
        } else if self.session.cap_exceeded(now) {
            self.session.end();
            self.flush()?;
        }

        if !self.session.is_active() {
            self.buffer.evict_expired(now);
        }

        self.buffer.push(frame);
        self.frames_seen += 1;
        Ok(())
    }

    /// Persist all buffered frames as one clip and clear the buffer.
    ///
    /// Flushing with an empty buffer is reported and leaves the state
    /// untouched; a write failure is escalated to the caller.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.buffer.is_empty() {
            self.mailbox
                .send("sentrycam: something has gone wrong with saving the video.");
            error!("Attempting to save an empty clip on camera {}", self.index);
            return Ok(None);
        }

        let frames = self.buffer.take_all();
        let path = self.clips.persist(&frames)?;
        debug!("Flushed {} frames on camera {}", frames.len(), self.index);
        Ok(Some(path))
    }

    /// Terminal cleanup: if a session is still in flight, flush it so the
    /// event window is not lost. Called exactly once, on the termination
    /// path.
    pub fn finalize(&mut self) {
        if self.session.is_active() {
            self.session.end();
            if let Err(e) = self.flush() {
                error!("Could not flush in-flight recording: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SentrycamConfig;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tempfile::TempDir;

    struct NullSource;

    #[async_trait]
    impl FrameSource for NullSource {
        async fn next_frame(&mut self) -> Result<FrameRecord> {
            Err(SentrycamError::device("no device in tests"))
        }
    }

    /// Worker backed by temp directories, fed via `observe`.
    fn test_worker(detectors: DetectorSet) -> (CameraWorker, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = SentrycamConfig::default();
        config.storage.recordings_root = dir.path().join("recordings").display().to_string();
        config.storage.stream_root = dir.path().join("stream").display().to_string();
        config.service.mailbox_name = "/sentrycam_camera_tests".to_string();

        let worker = CameraWorker::new(&config, Box::new(NullSource), detectors).unwrap();
        (worker, dir)
    }

    fn scripted_motion(script: Vec<bool>) -> DetectorSet {
        let steps = Arc::new(Mutex::new(script.into_iter()));
        DetectorSet::new(true, true).with_motion(move |_: &FrameRecord| {
            steps.lock().unwrap().next().unwrap_or(false)
        })
    }

    fn clip_count(worker: &CameraWorker) -> usize {
        fs::read_dir(worker.clips.dir()).unwrap().count()
    }

    #[test]
    fn test_detection_sequence_flushes_exactly_once() {
        // Detection signals over 17 cycles spaced 1s apart; the session
        // starts at cycle 3 and is still under the 15s cap when the
        // service terminates, so the flush happens on finalize.
        let signals = vec![
            false, false, true, true, true, false, false, false, false, false, false, false,
            false, false, false, false, false,
        ];
        let cycles = signals.len();
        let (mut worker, _dir) = test_worker(scripted_motion(signals));

        let base = Instant::now();
        for i in 0..cycles {
            let frame = FrameRecord::new(i as u64, base + Duration::from_secs(i as u64), vec![1; 8]);
            worker.observe(frame).unwrap();
        }

        assert!(worker.is_recording());
        assert_eq!(clip_count(&worker), 0);

        worker.finalize();

        assert_eq!(clip_count(&worker), 1, "exactly one clip must be written");
        assert!(!worker.is_recording());
        assert!(worker.buffer.is_empty(), "flush consumes the buffer");

        // Every frame from before the session start through the flush
        // point is in the clip: 17 frames of 8 bytes each.
        let clip = fs::read_dir(worker.clips.dir())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(clip.metadata().unwrap().len(), (cycles * 8) as u64);
    }

    #[test]
    fn test_session_cap_overrun_is_bounded_by_one_cycle() {
        // Continuous detection: the session must flush at the first cycle
        // whose age exceeds the 15s cap, i.e. within one cycle of it.
        let (mut worker, _dir) = test_worker(scripted_motion(vec![true; 40]));

        let base = Instant::now();
        let mut flushed_at_cycle = None;
        for i in 0..40u64 {
            let frame = FrameRecord::new(i, base + Duration::from_secs(i), vec![1; 8]);
            worker.observe(frame).unwrap();
            if flushed_at_cycle.is_none() && clip_count(&worker) == 1 {
                flushed_at_cycle = Some(i);
            }
        }

        // Session starts at cycle 0; age first exceeds 15s at cycle 16.
        assert_eq!(flushed_at_cycle, Some(16));
    }

    #[test]
    fn test_flush_with_empty_buffer_writes_nothing() {
        let (mut worker, _dir) = test_worker(DetectorSet::new(true, true));

        let result = worker.flush().unwrap();
        assert!(result.is_none());
        assert_eq!(clip_count(&worker), 0);
        assert!(worker.buffer.is_empty());
    }

    #[test]
    fn test_eviction_suspended_while_recording() {
        let (mut worker, _dir) = test_worker(scripted_motion(vec![true; 14]));

        let base = Instant::now();
        for i in 0..14u64 {
            let frame = FrameRecord::new(i, base + Duration::from_secs(i), vec![1; 8]);
            worker.observe(frame).unwrap();
        }

        // 14 cycles over 13 seconds: without the recording session the 10s
        // window would have evicted the oldest frames by now.
        assert_eq!(worker.buffer.len(), 14);
    }

    #[test]
    fn test_idle_eviction_trims_old_frames() {
        let (mut worker, _dir) = test_worker(scripted_motion(vec![false; 14]));

        let base = Instant::now();
        for i in 0..14u64 {
            let frame = FrameRecord::new(i, base + Duration::from_secs(i), vec![1; 8]);
            worker.observe(frame).unwrap();
        }

        // At cycle 13 anything strictly older than 10s (cycles 0..=2) is gone.
        let seqs: Vec<u64> = worker.buffer.iter().map(|f| f.seq).collect();
        assert_eq!(seqs.first(), Some(&3));
        assert_eq!(seqs.last(), Some(&13));
    }

    #[test]
    fn test_stream_publishing_follows_consumer_attachment() {
        let (mut worker, _dir) = test_worker(scripted_motion(vec![false; 4]));
        let stream_dir = worker.stream.dir().to_path_buf();
        let base = Instant::now();

        worker
            .observe(FrameRecord::new(0, base, vec![1; 8]))
            .unwrap();
        assert_eq!(fs::read_dir(&stream_dir).unwrap().count(), 0);

        worker.set_livestream(true);
        worker
            .observe(FrameRecord::new(1, base + Duration::from_secs(1), vec![1; 8]))
            .unwrap();
        worker
            .observe(FrameRecord::new(2, base + Duration::from_secs(2), vec![1; 8]))
            .unwrap();
        assert_eq!(fs::read_dir(&stream_dir).unwrap().count(), 2);

        worker.set_livestream(false);
        worker
            .observe(FrameRecord::new(3, base + Duration::from_secs(3), vec![1; 8]))
            .unwrap();
        assert_eq!(fs::read_dir(&stream_dir).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_pattern_source_produces_sequential_frames() {
        let mut source = TestPatternSource::new(1000);
        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert!(!first.is_empty());
        assert!(first.captured_at <= second.captured_at);
    }

    #[tokio::test]
    async fn test_device_failure_is_fatal() {
        let (mut worker, _dir) = test_worker(DetectorSet::new(true, true));
        assert!(matches!(
            worker.run_cycle().await,
            Err(SentrycamError::Device { .. })
        ));
    }
}
