//! The live-stream viewer: consumes the frames the capture service drops
//! into the shared stream directory and renders them in arrival order.
//!
//! The directory is the transport. The capture service writes each frame
//! under a monotonically increasing name, the viewer gets a creation event
//! from the filesystem watcher, loads the file, renders it and deletes it.
//! Residual files left over from a previous run are swept before watching
//! starts so the view never begins in the past.

use crate::config::SentrycamConfig;
use crate::daemon::{ServiceRecord, ServiceState, CAPTURE_SERVICE};
use crate::error::{Result, SentrycamError};
use crate::lock::{LockFile, LockProbe};
use crate::mailbox::MailboxSender;
use crate::protocol::{self, ServiceEvent, ServiceSignals};
use notify::{EventKind, RecursiveMode, Watcher};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shown when there is no live frame to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// The capture service is not attached
    NotRunning,
    /// The capture service is attached but frames are not arriving
    NoSignal,
}

/// The display seam. Windowing and image decoding live outside this crate;
/// the viewer loop only hands over raw frame bytes or a placeholder.
///
/// A transient render error means the frame was not decodable yet and the
/// load will be retried; any other error is fatal to the viewer.
pub trait Renderer: Send {
    fn render(&mut self, image: &[u8]) -> Result<()>;
    fn show_placeholder(&mut self, placeholder: Placeholder) -> Result<()>;
}

/// Stand-in display used when no windowing front end is wired up. Frames
/// are consumed and counted so the full protocol can run headless.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    frames: u64,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }
}

impl Renderer for HeadlessRenderer {
    fn render(&mut self, image: &[u8]) -> Result<()> {
        self.frames += 1;
        debug!("Rendered stream frame {} ({} bytes)", self.frames, image.len());
        Ok(())
    }

    fn show_placeholder(&mut self, placeholder: Placeholder) -> Result<()> {
        debug!("Showing placeholder {:?}", placeholder);
        Ok(())
    }
}

/// Bounded per-frame load retry, from the viewer configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    fn from_config(config: &SentrycamConfig) -> Self {
        Self {
            attempts: config.viewer.load_retry_attempts,
            delay: Duration::from_millis(config.viewer.load_retry_delay_ms),
        }
    }
}

/// Pause before rebuilding a failed watcher so a persistent failure does
/// not spin the loop.
const WATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Delete every regular file already sitting in the stream directory.
/// Frames published before the viewer attached are history, not live view.
pub fn discard_residual(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        info!("Discarded {} stale stream frames", removed);
    }
    removed
}

/// Load, render and delete one published stream frame.
///
/// The producer may still be writing the file when the creation event
/// arrives, so an empty or transiently undecodable frame is retried with a
/// short delay. A frame that disappears before a load succeeds is skipped
/// (`Ok(false)`); exhausting every attempt means the image backend is
/// broken and is escalated as fatal.
async fn consume_stream_file(
    path: &Path,
    renderer: &mut dyn Renderer,
    retry: &RetryPolicy,
) -> Result<bool> {
    for attempt in 0..retry.attempts {
        if attempt > 0 {
            tokio::time::sleep(retry.delay).await;
        }

        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Stream frame {} vanished before it was rendered", path.display());
                return Ok(false);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            // Still being written.
            continue;
        }

        match renderer.render(&data) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(path) {
                    if e.kind() != ErrorKind::NotFound {
                        warn!("Could not delete rendered frame {}: {}", path.display(), e);
                    }
                }
                return Ok(true);
            }
            Err(e) if e.is_transient() => {
                debug!("Retrying stream frame {}: {}", path.display(), e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(SentrycamError::device(format!(
        "could not load stream frame {} after {} attempts",
        path.display(),
        retry.attempts
    )))
}

/// The viewer's event loop and its single termination path.
pub async fn viewer_loop(
    config: &SentrycamConfig,
    mut record: ServiceRecord,
    mut renderer: Box<dyn Renderer>,
) -> i32 {
    let mailbox = MailboxSender::new(&config.service.mailbox_name);
    let capture_lock = LockFile::new(
        CAPTURE_SERVICE,
        &config.service.capture_lock_path,
        mailbox.clone(),
    );
    let stream_dir = config.stream_dir(config.camera.index);
    let retry = RetryPolicy::from_config(config);

    let mut signals = match ServiceSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!("Could not install signal handlers: {}", e);
            mailbox.send("sentrycam unexpected failure.");
            record.exit_status = 1;
            record.lock.release();
            return record.exit_status;
        }
    };
    record.state = ServiceState::Running;

    // If the producer is already up, announce ourselves so it starts
    // publishing.
    let mut producer_attached = false;
    if let LockProbe::Running(pid) = capture_lock.probe() {
        info!("Capture service already running with pid {}", pid);
        record.peer_pid = Some(pid);
        protocol::notify_peer_attached(pid);
        producer_attached = true;
    }

    'outer: loop {
        if !producer_attached {
            if renderer.show_placeholder(Placeholder::NotRunning).is_err() {
                record.exit_status = 1;
                break 'outer;
            }
            match signals.next().await {
                ServiceEvent::Terminate => break 'outer,
                ServiceEvent::PeerAttached => {
                    // The producer came up; answer its announcement so it
                    // starts publishing.
                    if let LockProbe::Running(pid) = capture_lock.probe() {
                        record.peer_pid = Some(pid);
                        protocol::notify_peer_attached(pid);
                    }
                    producer_attached = true;
                }
                ServiceEvent::PeerDetached => {
                    record.peer_pid = None;
                }
            }
            continue 'outer;
        }

        discard_residual(&stream_dir);

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut watcher = match notify::recommended_watcher(move |event| {
            let _ = tx.blocking_send(event);
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!("Could not create the stream watcher: {}", e);
                record.exit_status = 1;
                break 'outer;
            }
        };
        if let Err(e) = watcher.watch(&stream_dir, RecursiveMode::NonRecursive) {
            // The producer may not have created the directory yet.
            warn!("Cannot watch {} yet: {}", stream_dir.display(), e);
            let _ = renderer.show_placeholder(Placeholder::NoSignal);
            tokio::time::sleep(WATCH_RETRY_DELAY).await;
            continue 'outer;
        }
        debug!("Watching {}", stream_dir.display());

        loop {
            tokio::select! {
                biased;
                event = signals.next() => match event {
                    ServiceEvent::Terminate => break 'outer,
                    ServiceEvent::PeerDetached => {
                        info!("Capture service detached");
                        record.peer_pid = None;
                        producer_attached = false;
                        let _ = renderer.show_placeholder(Placeholder::NotRunning);
                        continue 'outer;
                    }
                    ServiceEvent::PeerAttached => {
                        // Duplicate announcement while already consuming.
                    }
                },
                received = rx.recv() => match received {
                    None => {
                        warn!("Stream watcher stopped; rebuilding");
                        let _ = renderer.show_placeholder(Placeholder::NoSignal);
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        continue 'outer;
                    }
                    Some(Err(e)) => {
                        // Watch errors are transient to the view.
                        warn!("Stream watch error: {}", e);
                        let _ = renderer.show_placeholder(Placeholder::NoSignal);
                    }
                    Some(Ok(event)) => {
                        if !matches!(event.kind, EventKind::Create(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            if path.is_dir() {
                                continue;
                            }
                            match consume_stream_file(path, renderer.as_mut(), &retry).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!("Skipped stream frame {}", path.display());
                                }
                                Err(e) => {
                                    error!("Rendering failed: {}", e);
                                    mailbox.send("sentrycam encountered an error.");
                                    record.exit_status = 1;
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    // The termination path runs exactly once, whichever exit the loop took.
    record.state = ServiceState::Terminating;
    if let Some(pid) = record.peer_pid {
        protocol::notify_peer_detached(pid);
    }
    record.lock.release();
    record.state = ServiceState::Gone;
    info!("Viewer exiting with status {}", record.exit_status);
    record.exit_status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    struct ScriptedRenderer {
        outcomes: VecDeque<Result<()>>,
        rendered: Vec<usize>,
    }

    impl ScriptedRenderer {
        fn new(outcomes: Vec<Result<()>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                rendered: Vec::new(),
            }
        }
    }

    impl Renderer for ScriptedRenderer {
        fn render(&mut self, image: &[u8]) -> Result<()> {
            let outcome = self.outcomes.pop_front().unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.rendered.push(image.len());
            }
            outcome
        }

        fn show_placeholder(&mut self, _placeholder: Placeholder) -> Result<()> {
            Ok(())
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 4,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_residual_sweep_removes_only_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("0.jpg"), b"x").unwrap();
        fs::write(dir.path().join("1.jpg"), b"y").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(discard_residual(dir.path()), 2);
        assert!(dir.path().join("nested").is_dir());
        assert_eq!(discard_residual(dir.path()), 0);
    }

    #[test]
    fn test_residual_sweep_tolerates_missing_directory() {
        let dir = tempdir().unwrap();
        assert_eq!(discard_residual(&dir.path().join("absent")), 0);
    }

    #[tokio::test]
    async fn test_rendered_frame_is_deleted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.jpg");
        fs::write(&path, vec![7u8; 64]).unwrap();

        let mut renderer = ScriptedRenderer::new(vec![]);
        let consumed = consume_stream_file(&path, &mut renderer, &quick_retry())
            .await
            .unwrap();

        assert!(consumed);
        assert_eq!(renderer.rendered, vec![64]);
        assert!(!path.exists(), "rendered frames are deleted");
    }

    #[tokio::test]
    async fn test_vanished_frame_is_skipped() {
        let dir = tempdir().unwrap();
        let mut renderer = ScriptedRenderer::new(vec![]);
        let consumed = consume_stream_file(&dir.path().join("gone.jpg"), &mut renderer, &quick_retry())
            .await
            .unwrap();

        assert!(!consumed);
        assert!(renderer.rendered.is_empty());
    }

    #[tokio::test]
    async fn test_transient_render_errors_are_retried() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.jpg");
        fs::write(&path, vec![7u8; 16]).unwrap();

        let mut renderer = ScriptedRenderer::new(vec![
            Err(SentrycamError::transient("frame not decodable yet")),
            Err(SentrycamError::transient("frame not decodable yet")),
            Ok(()),
        ]);
        let consumed = consume_stream_file(&path, &mut renderer, &quick_retry())
            .await
            .unwrap();

        assert!(consumed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.jpg");
        fs::write(&path, vec![7u8; 16]).unwrap();

        let outcomes = (0..8)
            .map(|_| Err(SentrycamError::transient("frame not decodable yet")))
            .collect();
        let mut renderer = ScriptedRenderer::new(outcomes);

        assert!(consume_stream_file(&path, &mut renderer, &quick_retry())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_nontransient_render_error_is_fatal_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.jpg");
        fs::write(&path, vec![7u8; 16]).unwrap();

        let mut renderer =
            ScriptedRenderer::new(vec![Err(SentrycamError::device("display lost"))]);

        assert!(consume_stream_file(&path, &mut renderer, &quick_retry())
            .await
            .is_err());
        assert!(path.exists(), "a fatally failed frame is left in place");
    }
}
