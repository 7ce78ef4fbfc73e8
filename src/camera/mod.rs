mod capture;
mod device;

use std::sync::Arc;

use opencv::core::Mat;
use thiserror::Error;

use crate::frame::Resolution;

pub use capture::CaptureStage;
pub use device::OpenCvCamera;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("capture device {0} unavailable")]
    Unavailable(String),
    #[error("capture device not open")]
    NotOpen,
    #[error("empty frame")]
    EmptyFrame,
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
    pub resolution: Resolution,
    pub fps: f64,
}

/// A video source exclusively owned by the capture stage.
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<DeviceInfo, CameraError>;
    fn read(&mut self) -> Result<Mat, CameraError>;
    fn release(&mut self);
}

/// Called once per pipeline start, so each run probes the device afresh.
pub type DeviceFactory = Arc<dyn Fn() -> Box<dyn CaptureDevice> + Send + Sync>;
