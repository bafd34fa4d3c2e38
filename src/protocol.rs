//! Signal-based handshake between the capture service and the viewer.
//!
//! The two services discover each other lazily through their lock files and
//! exchange one-shot, idempotent notifications: SIGUSR1 means "peer
//! attached", SIGUSR2 means "peer detached", and the interrupt/terminate/
//! quit class requests termination. No handler does any work itself; the
//! tokio signal streams are bridged into the service event loop, which
//! selects over them alongside frame acquisition.

use crate::error::Result;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, warn};

/// Events a service event loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The companion process announced itself (SIGUSR1)
    PeerAttached,
    /// The companion process is going away (SIGUSR2)
    PeerDetached,
    /// Termination requested (SIGINT/SIGTERM/SIGQUIT)
    Terminate,
}

/// The installed signal streams for one service process.
pub struct ServiceSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    peer_attached: Signal,
    peer_detached: Signal,
}

impl ServiceSignals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            peer_attached: signal(SignalKind::user_defined1())?,
            peer_detached: signal(SignalKind::user_defined2())?,
        })
    }

    /// Wait for the next control event. Termination takes priority when
    /// multiple signals are pending.
    pub async fn next(&mut self) -> ServiceEvent {
        tokio::select! {
            biased;
            _ = self.interrupt.recv() => ServiceEvent::Terminate,
            _ = self.terminate.recv() => ServiceEvent::Terminate,
            _ = self.quit.recv() => ServiceEvent::Terminate,
            _ = self.peer_attached.recv() => ServiceEvent::PeerAttached,
            _ = self.peer_detached.recv() => ServiceEvent::PeerDetached,
        }
    }
}

fn deliver(pid: i32, signum: libc::c_int, what: &str) -> bool {
    if pid <= 0 {
        return false;
    }
    let delivered = unsafe { libc::kill(pid, signum) == 0 };
    if delivered {
        debug!("Sent {} notification to pid {}", what, pid);
    } else {
        // The peer may have vanished between the probe and the signal;
        // notifications are best effort.
        warn!("Could not send {} notification to pid {}", what, pid);
    }
    delivered
}

/// Tell the peer this service is up and ready.
pub fn notify_peer_attached(pid: i32) -> bool {
    deliver(pid, libc::SIGUSR1, "attach")
}

/// Tell the peer this service is going away.
pub fn notify_peer_detached(pid: i32) -> bool {
    deliver(pid, libc::SIGUSR2, "detach")
}

/// Ask a service to shut down through its normal termination path.
pub fn request_termination(pid: i32) -> bool {
    deliver(pid, libc::SIGINT, "termination")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifying_unknown_peer_is_refused() {
        assert!(!notify_peer_attached(0));
        assert!(!notify_peer_detached(-5));
    }

    #[test]
    fn test_notifying_vanished_peer_reports_failure() {
        // Beyond the kernel's pid_max, so never a live process.
        assert!(!notify_peer_attached(1_999_999_999));
        assert!(!request_termination(1_999_999_999));
    }

    #[tokio::test]
    async fn test_peer_signals_are_bridged_to_events() {
        let mut signals = ServiceSignals::install().unwrap();
        let me = std::process::id() as i32;

        assert!(notify_peer_attached(me));
        assert_eq!(signals.next().await, ServiceEvent::PeerAttached);

        assert!(notify_peer_detached(me));
        assert_eq!(signals.next().await, ServiceEvent::PeerDetached);
    }
}
