use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single captured camera frame with its capture timestamp.
///
/// The image bytes are opaque to the rest of the system; detectors and the
/// clip store treat them as capabilities do, never inspecting the encoding.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Monotonically increasing per-service frame number
    pub seq: u64,
    /// When the frame was acquired from the device
    pub captured_at: Instant,
    /// Encoded image data (shared ownership for cheap cloning)
    pub data: Arc<Vec<u8>>,
}

impl FrameRecord {
    pub fn new(seq: u64, captured_at: Instant, data: Vec<u8>) -> Self {
        Self {
            seq,
            captured_at,
            data: Arc::new(data),
        }
    }

    /// Age of the frame relative to the given reference point.
    ///
    /// `Instant` is monotonic, so a frame "from the future" (possible in
    /// tests that fabricate timestamps) reports zero age.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    pub fn is_older_than(&self, now: Instant, window: Duration) -> bool {
        self.age(now) > window
    }

    /// A frame with no image data is the corrupt-frame condition reported by
    /// the device layer; it is fatal to the capture service.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_is_relative_to_reference() {
        let base = Instant::now();
        let frame = FrameRecord::new(0, base, vec![1, 2, 3]);
        let later = base + Duration::from_secs(4);
        assert_eq!(frame.age(later), Duration::from_secs(4));
    }

    #[test]
    fn test_is_older_than_is_strict() {
        let base = Instant::now();
        let frame = FrameRecord::new(0, base, vec![1]);
        let edge = base + Duration::from_secs(10);
        // Exactly at the window edge does not count as expired.
        assert!(!frame.is_older_than(edge, Duration::from_secs(10)));
        assert!(frame.is_older_than(edge + Duration::from_millis(1), Duration::from_secs(10)));
    }

    #[test]
    fn test_empty_frame_detection() {
        let frame = FrameRecord::new(0, Instant::now(), Vec::new());
        assert!(frame.is_empty());
    }
}
