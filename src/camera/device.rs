use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};

use crate::frame::Resolution;

use super::{CameraError, CaptureDevice, DeviceInfo};

pub struct OpenCvCamera {
    source: String,
    capture: Option<VideoCapture>,
}

impl OpenCvCamera {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            capture: None,
        }
    }
}

impl CaptureDevice for OpenCvCamera {
    fn open(&mut self) -> Result<DeviceInfo, CameraError> {
        self.release();

        let capture = match parse_device_index(&self.source) {
            Some(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
            None => VideoCapture::from_file(&self.source, videoio::CAP_ANY)?,
        };

        if !capture.is_opened()? {
            return Err(CameraError::Unavailable(self.source.clone()));
        }

        let info = DeviceInfo {
            resolution: Resolution {
                width: capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32,
                height: capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32,
            },
            fps: capture.get(videoio::CAP_PROP_FPS)?,
        };
        self.capture = Some(capture);
        Ok(info)
    }

    fn read(&mut self) -> Result<Mat, CameraError> {
        let capture = self.capture.as_mut().ok_or(CameraError::NotOpen)?;

        let mut frame = Mat::default();
        if !capture.read(&mut frame)? || frame.empty() {
            return Err(CameraError::EmptyFrame);
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                tracing::warn!(device = %self.source, error = %e, "failed to release capture device");
            }
        }
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Accepts `2` or `/dev/video2`; anything else is treated as a path or URL.
fn parse_device_index(source: &str) -> Option<i32> {
    if let Ok(index) = source.parse::<i32>() {
        return Some(index);
    }
    let digits = source.strip_prefix("/dev/video")?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.parse().ok();
    }
    None
}
