use std::sync::Arc;
use std::time::Duration;

use crate::frame::{DetectorResult, Frame, Resolution};
use crate::relay::{Command, Control, Relay};

use super::{Detector, DetectorFactory};

const INPUT_TIMEOUT: Duration = Duration::from_secs(1);

/// A detector and the frame size it was built for.
pub struct ActiveDetector {
    detector: Box<dyn Detector>,
    resolution: Resolution,
}

/// Worker that owns one detector instance.
pub struct DetectorStage {
    index: usize,
    factory: Arc<dyn DetectorFactory>,
    input: Relay<Frame>,
    output: Relay<DetectorResult>,
    control: Control,
}

impl DetectorStage {
    pub fn new(
        index: usize,
        factory: Arc<dyn DetectorFactory>,
        input: Relay<Frame>,
        output: Relay<DetectorResult>,
        control: Control,
    ) -> Self {
        Self {
            index,
            factory,
            input,
            output,
            control,
        }
    }

    pub fn run(self) {
        tracing::info!(detector = self.index, kind = self.factory.name(), "detector stage started");

        if let Some(mut active) = self.initialize() {
            loop {
                if let Some(Command::Stop) = self.control.poll() {
                    break;
                }
                self.process_next(&mut active, INPUT_TIMEOUT);
            }
        }

        self.input.drain();
        self.output.drain();
        tracing::info!(detector = self.index, "detector stage stopped");
    }

    /// Waits for the first frame and builds the detector from it. Returns
    /// `None` when stopped before a frame arrived.
    pub fn initialize(&self) -> Option<ActiveDetector> {
        loop {
            if let Some(Command::Stop) = self.control.poll() {
                return None;
            }

            let Some(frame) = self.input.recv_timeout(INPUT_TIMEOUT) else {
                continue;
            };
            if let Some(active) = self.build(&frame) {
                return Some(active);
            }
        }
    }

    /// Analyzes at most one frame. Returns whether a result was published.
    ///
    /// A frame whose size differs from the detector's (the device was
    /// reopened at another resolution) rebuilds the detector instead.
    pub fn process_next(&self, active: &mut ActiveDetector, timeout: Duration) -> bool {
        let Some(frame) = self.input.recv_timeout(timeout) else {
            return false;
        };

        if frame.resolution() != active.resolution {
            tracing::info!(
                detector = self.index,
                from = %active.resolution,
                to = %frame.resolution(),
                "frame size changed, rebuilding detector"
            );
            if let Some(rebuilt) = self.build(&frame) {
                *active = rebuilt;
            }
            return false;
        }

        match active.detector.detect(frame.image()) {
            Ok(result) => {
                self.output.send(result);
                true
            }
            Err(e) => {
                tracing::warn!(detector = self.index, error = %e, "frame analysis failed");
                false
            }
        }
    }

    fn build(&self, frame: &Frame) -> Option<ActiveDetector> {
        match self.factory.create(frame.image()) {
            Ok(detector) => {
                tracing::debug!(
                    detector = self.index,
                    resolution = %frame.resolution(),
                    "detector initialized"
                );
                Some(ActiveDetector {
                    detector,
                    resolution: frame.resolution(),
                })
            }
            Err(e) => {
                tracing::error!(detector = self.index, error = %e, "failed to initialize detector");
                None
            }
        }
    }
}
