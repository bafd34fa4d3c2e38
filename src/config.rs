use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SentrycamConfig {
    pub service: ServiceConfig,
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub buffer: BufferConfig,
    pub storage: StorageConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Lock file claimed by the capture service
    #[serde(default = "default_capture_lock_path")]
    pub capture_lock_path: String,

    /// Lock file claimed by the viewer process
    #[serde(default = "default_viewer_lock_path")]
    pub viewer_lock_path: String,

    /// POSIX message queue name for diagnostics sent to the GUI
    #[serde(default = "default_mailbox_name")]
    pub mailbox_name: String,

    /// Directory for the detached services' log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Camera device index (e.g., 0 for /dev/video0)
    #[serde(default = "default_camera_index")]
    pub index: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Run the human/face detector pair
    #[serde(default = "default_enable_human")]
    pub enable_human: bool,

    /// Run the motion detector
    #[serde(default = "default_enable_motion")]
    pub enable_motion: bool,

    /// Draw detection outlines on recorded frames
    #[serde(default = "default_enable_outlines")]
    pub enable_outlines: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BufferConfig {
    /// Rolling retention window for buffered frames, in seconds
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,

    /// Hard cap on the length of one recording session, in seconds
    #[serde(default = "default_session_cap_seconds")]
    pub session_cap_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Root directory for saved clips; per-camera subdirectories are
    /// created underneath. Defaults to <home>/recordings.
    #[serde(default = "default_recordings_root")]
    pub recordings_root: String,

    /// Root of the transient live-stream directory tree
    #[serde(default = "default_stream_root")]
    pub stream_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ViewerConfig {
    /// Attempts to load a stream image before giving up on it
    #[serde(default = "default_load_retry_attempts")]
    pub load_retry_attempts: u32,

    /// Delay between load attempts, in milliseconds
    #[serde(default = "default_load_retry_delay_ms")]
    pub load_retry_delay_ms: u64,
}

impl SentrycamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("sentrycam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("service.capture_lock_path", default_capture_lock_path())?
            .set_default("service.viewer_lock_path", default_viewer_lock_path())?
            .set_default("service.mailbox_name", default_mailbox_name())?
            .set_default("service.log_dir", default_log_dir())?
            .set_default("camera.index", default_camera_index())?
            .set_default("detection.enable_human", default_enable_human())?
            .set_default("detection.enable_motion", default_enable_motion())?
            .set_default("detection.enable_outlines", default_enable_outlines())?
            .set_default("buffer.retention_seconds", default_retention_seconds())?
            .set_default("buffer.session_cap_seconds", default_session_cap_seconds())?
            .set_default("storage.recordings_root", default_recordings_root())?
            .set_default("storage.stream_root", default_stream_root())?
            .set_default("viewer.load_retry_attempts", default_load_retry_attempts())?
            .set_default("viewer.load_retry_delay_ms", default_load_retry_delay_ms())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("SENTRYCAM").separator("_"))
            .build()?;

        let config: SentrycamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.retention_seconds == 0 {
            return Err(ConfigError::Message(
                "Buffer retention_seconds must be greater than 0".to_string(),
            ));
        }

        if self.buffer.session_cap_seconds <= self.buffer.retention_seconds {
            return Err(ConfigError::Message(
                "Session cap must be longer than the retention window".to_string(),
            ));
        }

        if !self.service.mailbox_name.starts_with('/') {
            return Err(ConfigError::Message(
                "Mailbox name must start with '/'".to_string(),
            ));
        }

        if self.viewer.load_retry_attempts == 0 {
            return Err(ConfigError::Message(
                "Viewer load_retry_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Per-camera clip output directory: `<recordings_root>/camera<N>/`
    pub fn clip_dir(&self, camera_index: u32) -> PathBuf {
        PathBuf::from(&self.storage.recordings_root).join(format!("camera{}", camera_index))
    }

    /// Per-camera transient stream directory: `<stream_root>/camera<N>/`
    pub fn stream_dir(&self, camera_index: u32) -> PathBuf {
        PathBuf::from(&self.storage.stream_root).join(format!("camera{}", camera_index))
    }
}

impl Default for SentrycamConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                capture_lock_path: default_capture_lock_path(),
                viewer_lock_path: default_viewer_lock_path(),
                mailbox_name: default_mailbox_name(),
                log_dir: default_log_dir(),
            },
            camera: CameraConfig {
                index: default_camera_index(),
            },
            detection: DetectionConfig {
                enable_human: default_enable_human(),
                enable_motion: default_enable_motion(),
                enable_outlines: default_enable_outlines(),
            },
            buffer: BufferConfig {
                retention_seconds: default_retention_seconds(),
                session_cap_seconds: default_session_cap_seconds(),
            },
            storage: StorageConfig {
                recordings_root: default_recordings_root(),
                stream_root: default_stream_root(),
            },
            viewer: ViewerConfig {
                load_retry_attempts: default_load_retry_attempts(),
                load_retry_delay_ms: default_load_retry_delay_ms(),
            },
        }
    }
}

// Default value functions
fn default_capture_lock_path() -> String {
    "/tmp/sentrycam_capture.pid".to_string()
}
fn default_viewer_lock_path() -> String {
    "/tmp/sentrycam_viewer.pid".to_string()
}
fn default_mailbox_name() -> String {
    "/sentrycam_messages".to_string()
}
fn default_log_dir() -> String {
    "/tmp".to_string()
}

fn default_camera_index() -> u32 {
    0
}

fn default_enable_human() -> bool {
    true
}
fn default_enable_motion() -> bool {
    true
}
fn default_enable_outlines() -> bool {
    true
}

fn default_retention_seconds() -> u64 {
    10
}
fn default_session_cap_seconds() -> u64 {
    15
}

fn default_recordings_root() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    format!("{}/recordings", home)
}
fn default_stream_root() -> String {
    "/tmp/sentrycam".to_string()
}

fn default_load_retry_attempts() -> u32 {
    40
}
fn default_load_retry_delay_ms() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SentrycamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer.retention_seconds, 10);
        assert_eq!(config.buffer.session_cap_seconds, 15);
    }

    #[test]
    fn test_retention_must_be_nonzero() {
        let mut config = SentrycamConfig::default();
        config.buffer.retention_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_cap_must_exceed_retention() {
        let mut config = SentrycamConfig::default();
        config.buffer.session_cap_seconds = config.buffer.retention_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mailbox_name_requires_leading_slash() {
        let mut config = SentrycamConfig::default();
        config.service.mailbox_name = "sentrycam_messages".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_camera_directories() {
        let config = SentrycamConfig::default();
        assert!(config
            .clip_dir(3)
            .to_string_lossy()
            .ends_with("recordings/camera3"));
        assert_eq!(
            config.stream_dir(0),
            PathBuf::from("/tmp/sentrycam/camera0")
        );
    }
}
