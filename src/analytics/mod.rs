mod motion;
mod stage;

use std::sync::Arc;

use opencv::core::Mat;
use thiserror::Error;

use crate::config::DetectorConfig;
use crate::frame::DetectorResult;

use motion::MotionDetectorFactory;
pub use stage::DetectorStage;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// One analysis algorithm, fed frames in capture order.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Mat) -> Result<DetectorResult, AnalyticsError>;
}

/// Builds a detector from the first frame a detector stage receives.
pub trait DetectorFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self, first_frame: &Mat) -> Result<Box<dyn Detector>, AnalyticsError>;
}

pub fn build_detectors(configs: &[DetectorConfig]) -> Vec<Arc<dyn DetectorFactory>> {
    configs
        .iter()
        .map(|config| match config {
            DetectorConfig::Motion(motion) => {
                Arc::new(MotionDetectorFactory::new(motion.clone())) as Arc<dyn DetectorFactory>
            }
        })
        .collect()
}
