//! Process supervision for the detached services.
//!
//! The controller process wins the start race and spawns an intermediate
//! child, which daemonizes itself (fork, new session, stdio to /dev/null)
//! and only then publishes its pid into the lock file. From there the
//! service runs a single event loop that selects over the bridged signal
//! streams and the capture cycle, so every external notification is
//! handled between cycles rather than inside a signal handler.

use crate::camera::{CameraWorker, FrameSource};
use crate::config::SentrycamConfig;
use crate::detector::DetectorSet;
use crate::error::Result;
use crate::lock::{LockFile, LockHandle, LockProbe};
use crate::mailbox::MailboxSender;
use crate::protocol::{self, ServiceEvent, ServiceSignals};
use crate::viewer::{self, Renderer};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub const CAPTURE_SERVICE: &str = "capture service";
pub const VIEWER_SERVICE: &str = "viewer";

/// Where a service is in its lifecycle. The record is process local; the
/// companion process learns about transitions through signals and the lock
/// file, never by sharing this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unstarted,
    Detached,
    Running,
    Terminating,
    Gone,
}

/// Process-local bookkeeping for one running service. Owned and mutated
/// only by that service's event loop.
#[derive(Debug)]
pub struct ServiceRecord {
    pub lock: LockHandle,
    pub state: ServiceState,
    pub peer_pid: Option<i32>,
    pub exit_status: i32,
}

impl ServiceRecord {
    pub fn new(lock: LockHandle) -> Self {
        Self {
            lock,
            state: ServiceState::Unstarted,
            peer_pid: None,
            exit_status: 0,
        }
    }
}

/// Detach the calling process from its controlling terminal.
///
/// Forks once and exits the parent, so the caller's own parent (the
/// controller waiting on the intermediate) is unblocked immediately. The
/// surviving child starts a new session, points stdio at /dev/null, moves
/// to the filesystem root and clears the umask. Must be called before any
/// tokio runtime exists.
pub fn daemonize() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error().into()),
        0 => {}
        _ => std::process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    let devnull = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR) };
    if devnull >= 0 {
        unsafe {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }

    unsafe { libc::umask(0) };
    std::env::set_current_dir("/")?;
    Ok(())
}

fn service_log_path(log_dir: &str, service_tag: &str) -> std::path::PathBuf {
    Path::new(log_dir).join(format!("sentrycam-{}.log", service_tag))
}

/// Point the global tracing subscriber at a per-service log file. Stdio is
/// already /dev/null by the time this runs, so a file is the only place
/// the detached services can report to.
fn init_service_logging(log_dir: &str, service_tag: &str) -> Result<()> {
    let path = service_log_path(log_dir, service_tag);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sentrycam=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// Entry point of the detached capture service process.
///
/// `open_source` runs after daemonization so any device descriptors it
/// opens belong to the final process. Never returns; the exit status is 0
/// after a clean termination signal and 1 after an unrecoverable error.
pub fn run_capture_service<F>(config: SentrycamConfig, open_source: F) -> !
where
    F: FnOnce(&SentrycamConfig) -> Result<Box<dyn FrameSource>>,
{
    let mailbox = MailboxSender::new(&config.service.mailbox_name);

    if daemonize().is_err() {
        mailbox.send("sentrycam unexpected failure.");
        std::process::exit(1);
    }

    // Logging failures are swallowed: with stdio gone there is nowhere
    // left to complain, and the service is still viable without a log.
    let _ = init_service_logging(&config.service.log_dir, "capture");
    info!("Capture service detached as pid {}", std::process::id());

    let lock = LockHandle::adopt(CAPTURE_SERVICE, &config.service.capture_lock_path);
    if let Err(e) = lock.publish_pid() {
        error!("Could not publish pid into the lock file: {}", e);
        mailbox.send("sentrycam unexpected failure.");
        lock.release();
        std::process::exit(1);
    }
    let mut record = ServiceRecord::new(lock);
    record.state = ServiceState::Detached;

    let source = match open_source(&config) {
        Ok(source) => source,
        Err(e) => {
            error!("Could not open camera {}: {}", config.camera.index, e);
            mailbox.send(&format!(
                "sentrycam failed to open camera{}.",
                config.camera.index
            ));
            record.lock.release();
            std::process::exit(1);
        }
    };

    let detectors = DetectorSet::new(config.detection.enable_human, config.detection.enable_motion);
    let worker = match CameraWorker::new(&config, source, detectors) {
        Ok(worker) => worker,
        Err(e) => {
            // The worker already mirrored the failure to the mailbox.
            error!("Could not construct the capture pipeline: {}", e);
            record.lock.release();
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Could not start the async runtime: {}", e);
            mailbox.send("sentrycam unexpected failure.");
            record.lock.release();
            std::process::exit(1);
        }
    };

    let status = runtime.block_on(capture_loop(&config, worker, record));
    std::process::exit(status);
}

/// The capture service's event loop and its single termination path.
async fn capture_loop(
    config: &SentrycamConfig,
    mut worker: CameraWorker,
    mut record: ServiceRecord,
) -> i32 {
    let mailbox = MailboxSender::new(&config.service.mailbox_name);
    let viewer_lock = LockFile::new(
        VIEWER_SERVICE,
        &config.service.viewer_lock_path,
        mailbox.clone(),
    );

    let mut signals = match ServiceSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!("Could not install signal handlers: {}", e);
            mailbox.send("sentrycam unexpected failure.");
            record.exit_status = 1;
            record.state = ServiceState::Terminating;
            worker.finalize();
            record.lock.release();
            return record.exit_status;
        }
    };
    record.state = ServiceState::Running;

    // A viewer that registered before we came up is told we exist; it will
    // answer with an attach notification once it is ready to consume.
    if let LockProbe::Running(pid) = viewer_lock.probe() {
        info!("Viewer already registered with pid {}", pid);
        protocol::notify_peer_attached(pid);
    }

    loop {
        tokio::select! {
            biased;
            event = signals.next() => match event {
                ServiceEvent::Terminate => {
                    info!("Termination requested");
                    break;
                }
                ServiceEvent::PeerAttached => {
                    if let LockProbe::Running(pid) = viewer_lock.probe() {
                        record.peer_pid = Some(pid);
                    }
                    worker.set_livestream(true);
                }
                ServiceEvent::PeerDetached => {
                    record.peer_pid = None;
                    worker.set_livestream(false);
                }
            },
            result = worker.run_cycle() => {
                if result.is_err() {
                    record.exit_status = 1;
                    break;
                }
            }
        }
    }

    // The termination path runs exactly once, whichever exit the loop took.
    record.state = ServiceState::Terminating;
    worker.finalize();
    if let Some(pid) = record.peer_pid {
        protocol::notify_peer_detached(pid);
    }
    record.lock.release();
    record.state = ServiceState::Gone;
    info!(
        "Capture service exiting with status {}",
        record.exit_status
    );
    record.exit_status
}

/// Entry point of the detached viewer process. Mirrors the capture
/// service's startup sequence; the rendering loop itself lives in
/// `viewer.rs`.
pub fn run_viewer_service(config: SentrycamConfig, renderer: Box<dyn Renderer>) -> ! {
    let mailbox = MailboxSender::new(&config.service.mailbox_name);

    if daemonize().is_err() {
        mailbox.send("sentrycam unexpected failure.");
        std::process::exit(1);
    }

    let _ = init_service_logging(&config.service.log_dir, "viewer");
    info!("Viewer detached as pid {}", std::process::id());

    let lock = LockHandle::adopt(VIEWER_SERVICE, &config.service.viewer_lock_path);
    if let Err(e) = lock.publish_pid() {
        error!("Could not publish pid into the lock file: {}", e);
        mailbox.send("sentrycam unexpected failure.");
        lock.release();
        std::process::exit(1);
    }
    let mut record = ServiceRecord::new(lock);
    record.state = ServiceState::Detached;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Could not start the async runtime: {}", e);
            mailbox.send("sentrycam unexpected failure.");
            record.lock.release();
            std::process::exit(1);
        }
    };

    let status = runtime.block_on(viewer::viewer_loop(&config, record, renderer));
    std::process::exit(status);
}
