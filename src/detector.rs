//! Detection capabilities and the per-cycle detection gate.
//!
//! The vision algorithms themselves live outside this crate; the capture
//! loop only sees each detector as an opaque boolean capability.

use crate::frame::FrameRecord;

/// An opaque detection capability run once per captured frame.
pub trait Detector: Send {
    fn evaluate(&mut self, frame: &FrameRecord) -> bool;
}

impl<F> Detector for F
where
    F: FnMut(&FrameRecord) -> bool + Send,
{
    fn evaluate(&mut self, frame: &FrameRecord) -> bool {
        self(frame)
    }
}

/// The detector set consulted each capture cycle.
///
/// The gating formula is `(human OR face) AND motion`, with a disabled or
/// absent detector counting as vacuously true so the remaining detector
/// still gates. Several historical revisions of this system disagree on
/// the formula; this one is kept as shipped, deliberately.
pub struct DetectorSet {
    human: Option<Box<dyn Detector>>,
    face: Option<Box<dyn Detector>>,
    motion: Option<Box<dyn Detector>>,
    enable_human: bool,
    enable_motion: bool,
}

impl DetectorSet {
    pub fn new(enable_human: bool, enable_motion: bool) -> Self {
        Self {
            human: None,
            face: None,
            motion: None,
            enable_human,
            enable_motion,
        }
    }

    pub fn with_human(mut self, detector: impl Detector + 'static) -> Self {
        self.human = Some(Box::new(detector));
        self
    }

    pub fn with_face(mut self, detector: impl Detector + 'static) -> Self {
        self.face = Some(Box::new(detector));
        self
    }

    pub fn with_motion(mut self, detector: impl Detector + 'static) -> Self {
        self.motion = Some(Box::new(detector));
        self
    }

    /// Evaluate the detection signal for one frame.
    pub fn signal(&mut self, frame: &FrameRecord) -> bool {
        let mut human_found = true;
        let mut face_found = true;
        let mut motion_detected = true;

        if self.enable_human {
            if let Some(detector) = self.human.as_mut() {
                human_found = detector.evaluate(frame);
            }
            if let Some(detector) = self.face.as_mut() {
                face_found = detector.evaluate(frame);
            }
        }
        if self.enable_motion {
            if let Some(detector) = self.motion.as_mut() {
                motion_detected = detector.evaluate(frame);
            }
        }

        (human_found || face_found) && motion_detected
    }
}
