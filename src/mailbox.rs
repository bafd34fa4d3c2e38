//! Best-effort diagnostic channel from the backend services to the GUI.
//!
//! Implemented over a POSIX message queue so that any backend process can
//! drop a short free-text notification for the foreground process without
//! ever blocking. Delivery is explicitly not guaranteed; the lock file
//! remains the authoritative source of "is the service running".

use crate::error::{Result, SentrycamError};
use std::ffi::CString;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Maximum number of undelivered messages the queue retains.
pub const MAILBOX_CAPACITY: i64 = 5;

/// Maximum length of a single diagnostic message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 120;

/// Coarse daemon-state indication the GUI derives from a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonIndication {
    /// The message prefix marks a fatal backend condition
    Dead,
    /// No known prefix matched; show the text as-is
    Verbatim,
}

/// Message prefixes the GUI pattern-matches to flip its alive/dead
/// indicator. Everything else is displayed verbatim.
const FATAL_PREFIXES: &[&str] = &[
    "sentrycam could not create",
    "sentrycam failed to open camera",
    "sentrycam encountered an error",
    "sentrycam unexpected failure",
    "sentrycam: something has gone wrong",
];

pub fn classify(message: &str) -> DaemonIndication {
    if FATAL_PREFIXES.iter().any(|p| message.starts_with(p)) {
        DaemonIndication::Dead
    } else {
        DaemonIndication::Verbatim
    }
}

fn queue_name(name: &str) -> CString {
    // The validate() step guarantees the leading '/', but senders can be
    // constructed from raw strings in tests.
    let normalized = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(normalized).unwrap_or_else(|_| CString::new("/sentrycam_messages").expect("static name"))
}

/// Write end of the mailbox. Cheap to clone and safe to use from any
/// backend component; `send` opens and closes the queue per call so a
/// sender held across a fork never leaks a descriptor.
#[derive(Debug, Clone)]
pub struct MailboxSender {
    name: CString,
}

impl MailboxSender {
    pub fn new(name: &str) -> Self {
        Self {
            name: queue_name(name),
        }
    }

    /// Send a diagnostic message without blocking.
    ///
    /// Returns false when no receiver has created the queue, the queue is
    /// full, or the send fails for any other reason. Messages longer than
    /// [`MAX_MESSAGE_LEN`] bytes are truncated.
    pub fn send(&self, text: &str) -> bool {
        let mqd = unsafe { libc::mq_open(self.name.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
        if mqd == -1 {
            debug!("No diagnostic mailbox receiver attached");
            return false;
        }

        let bytes = text.as_bytes();
        let len = bytes.len().min(MAX_MESSAGE_LEN);
        let sent = unsafe {
            libc::mq_send(mqd, bytes.as_ptr() as *const libc::c_char, len, 0) == 0
        };
        if !sent {
            warn!("Failed to deliver diagnostic message: {}", text);
        }

        unsafe {
            libc::mq_close(mqd);
        }
        sent
    }
}

/// Read end of the mailbox, owned by the GUI process. Creating the
/// receiver creates the queue with the bounded capacity; dropping it
/// closes and unlinks the queue.
pub struct MailboxReceiver {
    name: CString,
    mqd: libc::mqd_t,
}

impl MailboxReceiver {
    pub fn open(name: &str) -> Result<Self> {
        let name = queue_name(name);
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_flags = 0;
        attr.mq_maxmsg = MAILBOX_CAPACITY;
        attr.mq_msgsize = MAX_MESSAGE_LEN as i64;
        attr.mq_curmsgs = 0;

        let mqd = unsafe {
            libc::mq_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_RDONLY,
                0o600 as libc::mode_t,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd == -1 {
            return Err(SentrycamError::Io(std::io::Error::last_os_error()));
        }

        Ok(Self { name, mqd })
    }

    /// Receive the next message in FIFO order, waiting at most `timeout`.
    /// Returns `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = SystemTime::now() + timeout;
        let since_epoch = deadline
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SentrycamError::system(format!("clock error: {}", e)))?;
        let abs_timeout = libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
        };

        let mut buffer = [0u8; MAX_MESSAGE_LEN];
        let received = unsafe {
            libc::mq_timedreceive(
                self.mqd,
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                std::ptr::null_mut(),
                &abs_timeout,
            )
        };

        if received < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ETIMEDOUT) | Some(libc::EINTR) => Ok(None),
                _ => Err(SentrycamError::Io(err)),
            };
        }

        let text = String::from_utf8_lossy(&buffer[..received as usize]).into_owned();
        Ok(Some(text))
    }

    /// Drain every outstanding message, invoking the handler in FIFO order.
    pub fn on_messages<F: FnMut(&str)>(&self, mut handler: F) -> Result<()> {
        while let Some(message) = self.recv_timeout(Duration::ZERO)? {
            handler(&message);
        }
        Ok(())
    }
}

impl Drop for MailboxReceiver {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
            libc::mq_unlink(self.name.as_ptr());
        }
    }
}
