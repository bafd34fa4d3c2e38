//! Filesystem-backed singleton lock for the long-lived services.
//!
//! A lock file existing means a service claims to be running; its content
//! must be the decimal pid of a live process. Anything else is self-healed:
//! a tampered or stale file is deleted on the spot and the prober proceeds
//! as if no service were running. The pid is written into the file only
//! after the owning process has become the final background process, so a
//! reader can never pick up the pid of an intermediate, about-to-exit
//! parent.

use crate::error::{Result, SentrycamError};
use crate::mailbox::MailboxSender;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Liveness probe: signal 0 delivers nothing but reports whether the
/// process exists (and is signalable by this user).
pub fn is_pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Outcome of probing a service's lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockProbe {
    /// No lock file, or a tampered/stale file that was purged
    NotRunning,
    /// A live process owns the lock
    Running(i32),
    /// The lock file exists but the owner has not published its pid yet;
    /// the service is between winning the start race and daemonizing
    Starting,
}

/// One logical service's lock file.
pub struct LockFile {
    service: &'static str,
    path: PathBuf,
    mailbox: MailboxSender,
}

impl LockFile {
    pub fn new(service: &'static str, path: impl Into<PathBuf>, mailbox: MailboxSender) -> Self {
        Self {
            service,
            path: path.into(),
            mailbox,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether the service is running, self-healing bad lock files.
    ///
    /// Probing never mutates a healthy lock file, so repeated probes with no
    /// intervening acquire or process death always return the same result,
    /// and a stale file is cleaned up at most once.
    pub fn probe(&self) -> LockProbe {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LockProbe::NotRunning,
            Err(e) => {
                warn!(
                    "Could not read {} lock file {}: {}",
                    self.service,
                    self.path.display(),
                    e
                );
                return LockProbe::NotRunning;
            }
        };

        // Scan character by character: anything that is not a digit
        // (ignoring trailing newline/NUL) marks the file as tampered.
        for &byte in &content {
            if byte.is_ascii_digit() || byte == b'\n' || byte == 0 {
                continue;
            }
            warn!(
                "Lock file {} does not contain a process id; removing it",
                self.path.display()
            );
            self.purge();
            self.mailbox
                .send(&format!("sentrycam: {} lock file has been tampered.", self.service));
            return LockProbe::NotRunning;
        }

        let digits: String = content
            .iter()
            .filter(|b| b.is_ascii_digit())
            .map(|&b| b as char)
            .collect();
        if digits.is_empty() {
            // Created by a winner that has not daemonized yet.
            return LockProbe::Starting;
        }

        let pid: i32 = match digits.parse() {
            Ok(pid) => pid,
            Err(_) => {
                warn!(
                    "Lock file {} holds an out-of-range process id; removing it",
                    self.path.display()
                );
                self.purge();
                self.mailbox
                    .send(&format!("sentrycam: {} lock file has been tampered.", self.service));
                return LockProbe::NotRunning;
            }
        };

        if is_pid_alive(pid) {
            debug!("{} is running with pid {}", self.service, pid);
            LockProbe::Running(pid)
        } else {
            warn!(
                "Removing lock file {} for defunct process {}",
                self.path.display(),
                pid
            );
            self.purge();
            self.mailbox
                .send(&format!("sentrycam: stale {} lock file removed.", self.service));
            LockProbe::NotRunning
        }
    }

    /// Claim the lock for a service about to start.
    ///
    /// Exclusive creation is mandatory: two concurrent acquires race on the
    /// filesystem, not on a check-then-act sequence, so exactly one wins.
    pub fn acquire(&self) -> Result<LockHandle> {
        match self.probe() {
            LockProbe::Running(pid) => {
                return Err(SentrycamError::AlreadyRunning {
                    service: self.service,
                    pid,
                })
            }
            LockProbe::Starting => {
                return Err(SentrycamError::AlreadyRunning {
                    service: self.service,
                    pid: 0,
                })
            }
            LockProbe::NotRunning => {}
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {
                info!("Created {} lock file {}", self.service, self.path.display());
                Ok(LockHandle {
                    service: self.service,
                    path: self.path.clone(),
                })
            }
            Err(source) => Err(SentrycamError::Permission {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn purge(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                "Could not remove lock file {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// Ownership of a claimed lock file.
///
/// Dropping a handle does NOT remove the file: the controller process that
/// won the start race hands the file over to the daemonized service, which
/// adopts it by path and removes it on its own termination path.
#[derive(Debug)]
pub struct LockHandle {
    service: &'static str,
    path: PathBuf,
}

impl LockHandle {
    /// Take ownership of an already-created lock file in the final service
    /// process.
    pub fn adopt(service: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish this process's pid into the lock file. Must only be called
    /// once the caller is the final background process.
    pub fn publish_pid(&self) -> Result<()> {
        fs::write(&self.path, std::process::id().to_string())?;
        info!(
            "Published pid {} into {}",
            std::process::id(),
            self.path.display()
        );
        Ok(())
    }

    /// Remove the lock file on the owner's clean shutdown path.
    pub fn release(self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed {} lock file", self.service),
            Err(e) => warn!(
                "Could not remove {} lock file {}: {}",
                self.service,
                self.path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lock_at(dir: &Path, name: &str) -> LockFile {
        LockFile::new(
            "capture service",
            dir.join(name),
            MailboxSender::new("/sentrycam_lock_tests"),
        )
    }

    #[test]
    fn test_absent_file_means_not_running() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "absent.pid");
        assert_eq!(lock.probe(), LockProbe::NotRunning);
    }

    #[test]
    fn test_live_pid_means_running() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "live.pid");
        fs::write(lock.path(), std::process::id().to_string()).unwrap();
        assert_eq!(lock.probe(), LockProbe::Running(std::process::id() as i32));
    }

    #[test]
    fn test_trailing_newline_is_tolerated() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "newline.pid");
        fs::write(lock.path(), format!("{}\n", std::process::id())).unwrap();
        assert_eq!(lock.probe(), LockProbe::Running(std::process::id() as i32));
    }

    #[test]
    fn test_tampered_file_is_purged_and_reports_not_running() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "tampered.pid");
        fs::write(lock.path(), "12x").unwrap();

        assert_eq!(lock.probe(), LockProbe::NotRunning);
        assert!(!lock.path().exists(), "tampered file must be deleted");
        // A second probe right after must also report not running, cleanly.
        assert_eq!(lock.probe(), LockProbe::NotRunning);
    }

    #[test]
    fn test_stale_pid_is_purged() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "stale.pid");
        // Pid values beyond the kernel's pid_max never name a live process.
        fs::write(lock.path(), "1999999999").unwrap();

        assert_eq!(lock.probe(), LockProbe::NotRunning);
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_probe_is_idempotent_for_live_owner() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "idempotent.pid");
        fs::write(lock.path(), std::process::id().to_string()).unwrap();

        let first = lock.probe();
        for _ in 0..5 {
            assert_eq!(lock.probe(), first);
        }
        assert!(lock.path().exists());
    }

    #[test]
    fn test_empty_file_means_starting() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "starting.pid");
        fs::write(lock.path(), "").unwrap();
        assert_eq!(lock.probe(), LockProbe::Starting);
        // Starting blocks a second acquire.
        assert!(matches!(
            lock.acquire(),
            Err(SentrycamError::AlreadyRunning { pid: 0, .. })
        ));
    }

    #[test]
    fn test_acquire_fails_against_live_owner() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "owned.pid");
        fs::write(lock.path(), std::process::id().to_string()).unwrap();
        assert!(matches!(
            lock.acquire(),
            Err(SentrycamError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn test_publish_and_release() {
        let dir = tempdir().unwrap();
        let lock = lock_at(dir.path(), "owned.pid");
        let handle = lock.acquire().unwrap();
        handle.publish_pid().unwrap();
        assert_eq!(lock.probe(), LockProbe::Running(std::process::id() as i32));
        handle.release();
        assert_eq!(lock.probe(), LockProbe::NotRunning);
    }

    #[test]
    fn test_concurrent_acquire_has_exactly_one_winner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("race.pid");

        let mut handles = Vec::new();
        for _ in 0..2 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let lock = LockFile::new(
                    "capture service",
                    path,
                    MailboxSender::new("/sentrycam_lock_tests"),
                );
                lock.acquire().is_ok()
            }));
        }

        let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            outcomes.iter().filter(|&&won| won).count(),
            1,
            "exactly one concurrent acquire may succeed"
        );
    }
}
