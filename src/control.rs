//! Foreground control surface: starting, stopping and querying the
//! detached services.
//!
//! Starting is a three-process handoff. The controller wins the lock race
//! by creating the lock file exclusively, spawns its own executable with a
//! hidden service subcommand and waits for that intermediate to exit. The
//! intermediate daemonizes, so the wait returns as soon as the final
//! service process exists; that process adopts the lock file by path and
//! publishes its pid into it. Stopping is just a termination signal; the
//! service owns its cleanup.

use crate::config::SentrycamConfig;
use crate::daemon::{CAPTURE_SERVICE, VIEWER_SERVICE};
use crate::error::{Result, SentrycamError};
use crate::lock::{LockFile, LockProbe};
use crate::mailbox::MailboxSender;
use crate::protocol;
use std::process::Command;
use tracing::{error, info, warn};

/// What happened on a start request, for the caller to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    PermissionError,
}

/// Detection switches passed through to the capture service.
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    pub enable_human: bool,
    pub enable_motion: bool,
    pub enable_outlines: bool,
    pub camera_index: u32,
}

impl StartOptions {
    pub fn from_config(config: &SentrycamConfig) -> Self {
        Self {
            enable_human: config.detection.enable_human,
            enable_motion: config.detection.enable_motion,
            enable_outlines: config.detection.enable_outlines,
            camera_index: config.camera.index,
        }
    }
}

/// Handle the foreground process uses to manage both services.
pub struct Controller {
    config: SentrycamConfig,
    config_path: String,
}

impl Controller {
    pub fn new(config: SentrycamConfig, config_path: impl Into<String>) -> Self {
        Self {
            config,
            config_path: config_path.into(),
        }
    }

    fn mailbox(&self) -> MailboxSender {
        MailboxSender::new(&self.config.service.mailbox_name)
    }

    fn capture_lock(&self) -> LockFile {
        LockFile::new(
            CAPTURE_SERVICE,
            &self.config.service.capture_lock_path,
            self.mailbox(),
        )
    }

    fn viewer_lock(&self) -> LockFile {
        LockFile::new(
            VIEWER_SERVICE,
            &self.config.service.viewer_lock_path,
            self.mailbox(),
        )
    }

    /// Start the capture service unless one is already running.
    pub fn start(&self, options: &StartOptions) -> Result<StartOutcome> {
        let handle = match self.capture_lock().acquire() {
            Ok(handle) => handle,
            Err(SentrycamError::AlreadyRunning { pid, .. }) => {
                info!("Capture service is already running (pid {})", pid);
                return Ok(StartOutcome::AlreadyRunning);
            }
            Err(SentrycamError::Permission { path, source }) => {
                error!("Cannot create lock file {}: {}", path.display(), source);
                return Ok(StartOutcome::PermissionError);
            }
            Err(e) => return Err(e),
        };

        let mut command = Command::new(std::env::current_exe()?);
        command
            .arg("--config")
            .arg(&self.config_path)
            .arg("run-capture")
            .arg("--camera")
            .arg(options.camera_index.to_string());
        if !options.enable_human {
            command.arg("--no-human-detection");
        }
        if !options.enable_motion {
            command.arg("--no-motion-detection");
        }
        if !options.enable_outlines {
            command.arg("--no-outlines");
        }

        self.spawn_service(command, handle)
    }

    /// Start the viewer unless one is already running.
    pub fn start_viewer(&self) -> Result<StartOutcome> {
        let handle = match self.viewer_lock().acquire() {
            Ok(handle) => handle,
            Err(SentrycamError::AlreadyRunning { pid, .. }) => {
                info!("Viewer is already running (pid {})", pid);
                return Ok(StartOutcome::AlreadyRunning);
            }
            Err(SentrycamError::Permission { path, source }) => {
                error!("Cannot create lock file {}: {}", path.display(), source);
                return Ok(StartOutcome::PermissionError);
            }
            Err(e) => return Err(e),
        };

        let mut command = Command::new(std::env::current_exe()?);
        command
            .arg("--config")
            .arg(&self.config_path)
            .arg("run-viewer");

        self.spawn_service(command, handle)
    }

    /// Spawn the intermediate and reap it; the daemonized grandchild keeps
    /// the already-created lock file, so the handle must not remove it on
    /// this path.
    fn spawn_service(
        &self,
        mut command: Command,
        handle: crate::lock::LockHandle,
    ) -> Result<StartOutcome> {
        let spawned = command.spawn().and_then(|mut child| child.wait());
        match spawned {
            Ok(status) if status.success() => {
                // Dropping the handle leaves the file for the service to adopt.
                drop(handle);
                Ok(StartOutcome::Started)
            }
            Ok(status) => {
                handle.release();
                Err(SentrycamError::system(format!(
                    "service process exited with {} before detaching",
                    status
                )))
            }
            Err(e) => {
                handle.release();
                Err(e.into())
            }
        }
    }

    /// Ask the capture service to terminate. Returns false when nothing is
    /// running. The service removes its own lock file on the way out, so
    /// this never touches the file.
    pub fn stop(&self) -> bool {
        match self.capture_lock().probe() {
            LockProbe::Running(pid) => {
                info!("Stopping capture service (pid {})", pid);
                protocol::request_termination(pid)
            }
            LockProbe::Starting => {
                warn!("Capture service is still starting; nothing to signal yet");
                false
            }
            LockProbe::NotRunning => false,
        }
    }

    /// Ask the viewer to terminate. Returns false when nothing is running.
    pub fn stop_viewer(&self) -> bool {
        match self.viewer_lock().probe() {
            LockProbe::Running(pid) => {
                info!("Stopping viewer (pid {})", pid);
                protocol::request_termination(pid)
            }
            LockProbe::Starting => false,
            LockProbe::NotRunning => false,
        }
    }

    pub fn probe_capture(&self) -> LockProbe {
        self.capture_lock().probe()
    }

    pub fn probe_viewer(&self) -> LockProbe {
        self.viewer_lock().probe()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.capture_lock().probe(), LockProbe::NotRunning)
    }

    pub fn is_viewer_running(&self) -> bool {
        !matches!(self.viewer_lock().probe(), LockProbe::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn controller(dir: &std::path::Path) -> Controller {
        let mut config = SentrycamConfig::default();
        config.service.capture_lock_path =
            dir.join("capture.pid").display().to_string();
        config.service.viewer_lock_path = dir.join("viewer.pid").display().to_string();
        config.service.mailbox_name = "/sentrycam_control_tests".to_string();
        Controller::new(config, "sentrycam.toml")
    }

    #[test]
    fn test_stop_without_running_service_reports_false() {
        let dir = tempdir().unwrap();
        let controller = controller(dir.path());
        assert!(!controller.stop());
        assert!(!controller.stop_viewer());
    }

    #[test]
    fn test_stop_skips_a_service_that_is_still_starting() {
        let dir = tempdir().unwrap();
        let controller = controller(dir.path());
        fs::write(&controller.config.service.capture_lock_path, "").unwrap();
        // An empty lock file means the pid is not published yet.
        assert!(!controller.stop());
        assert!(controller.is_running());
    }

    #[test]
    fn test_is_running_tracks_the_lock_file() {
        let dir = tempdir().unwrap();
        let controller = controller(dir.path());
        assert!(!controller.is_running());

        fs::write(
            &controller.config.service.capture_lock_path,
            std::process::id().to_string(),
        )
        .unwrap();
        assert!(controller.is_running());
        assert!(!controller.is_viewer_running());
    }

    #[test]
    fn test_stale_lock_is_healed_by_a_status_query() {
        let dir = tempdir().unwrap();
        let controller = controller(dir.path());
        fs::write(&controller.config.service.capture_lock_path, "1999999999").unwrap();

        assert!(!controller.is_running());
        assert!(!std::path::Path::new(&controller.config.service.capture_lock_path).exists());
    }

    #[test]
    fn test_start_options_mirror_config() {
        let mut config = SentrycamConfig::default();
        config.detection.enable_motion = false;
        config.camera.index = 2;
        let options = StartOptions::from_config(&config);
        assert!(options.enable_human);
        assert!(!options.enable_motion);
        assert_eq!(options.camera_index, 2);
    }
}
