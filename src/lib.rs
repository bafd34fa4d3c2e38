pub mod config;
pub mod error;
pub mod frame;
pub mod buffer;
pub mod detector;
pub mod storage;
pub mod camera;
pub mod mailbox;
pub mod lock;
pub mod protocol;
pub mod daemon;
pub mod viewer;
pub mod control;

pub use config::SentrycamConfig;
pub use error::{Result, SentrycamError};
pub use buffer::{FrameRingBuffer, RecordingSession, SessionState};
pub use camera::{CameraWorker, FrameSource, TestPatternSource};
pub use control::{Controller, StartOptions, StartOutcome};
pub use daemon::{ServiceRecord, ServiceState};
pub use detector::{Detector, DetectorSet};
pub use frame::FrameRecord;
pub use lock::{LockFile, LockHandle, LockProbe};
pub use mailbox::{DaemonIndication, MailboxReceiver, MailboxSender};
pub use viewer::{HeadlessRenderer, Placeholder, Renderer};
