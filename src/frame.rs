use std::fmt;
use std::time::Instant;

use opencv::core::{Mat, Scalar, Size, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: i32,
    pub height: i32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A BGR image plus the instant it was read from the device.
///
/// Every consumer gets its own copy; stages only draw on frames they own.
pub struct Frame {
    image: Mat,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: Mat, captured_at: Instant) -> Self {
        Self { image, captured_at }
    }

    pub fn image(&self) -> &Mat {
        &self.image
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.image.cols(),
            height: self.image.rows(),
        }
    }

    pub fn into_image(self) -> Mat {
        self.image
    }

    pub fn try_clone(&self) -> opencv::Result<Self> {
        Ok(Self {
            image: self.image.try_clone()?,
            captured_at: self.captured_at,
        })
    }
}

pub struct DetectorResult {
    pub overlay: Mat,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Per-detector activity, ordered by detector index.
    Flags(Vec<bool>),
    /// The capture feed has stalled.
    Error,
}

impl Status {
    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error)
    }

    #[cfg(test)]
    pub fn flag(&self, detector: usize) -> Option<bool> {
        match self {
            Status::Flags(flags) => flags.get(detector).copied(),
            Status::Error => None,
        }
    }

    pub fn active_detectors(&self) -> Vec<usize> {
        match self {
            Status::Flags(flags) => flags
                .iter()
                .enumerate()
                .filter(|(_, active)| **active)
                .map(|(i, _)| i)
                .collect(),
            Status::Error => Vec::new(),
        }
    }
}

pub struct CompositeFrame {
    pub frame: Frame,
    pub status: Status,
}

impl CompositeFrame {
    pub fn try_clone(&self) -> opencv::Result<Self> {
        Ok(Self {
            frame: self.frame.try_clone()?,
            status: self.status.clone(),
        })
    }
}

/// Zero-filled image with the same size and type as `like`.
pub fn blank_like(like: &Mat) -> opencv::Result<Mat> {
    blank(like.size()?, like.typ())
}

pub fn blank(size: Size, typ: i32) -> opencv::Result<Mat> {
    Mat::new_size_with_default(size, typ, Scalar::all(0.0))
}

pub fn encode_jpeg(mat: &Mat) -> Option<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::new();
    imgcodecs::imencode(".jpg", mat, &mut buf, &params).ok()?;
    Some(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC3;

    #[test]
    fn test_status_flags() {
        let status = Status::Flags(vec![false, true, true]);
        assert_eq!(status.flag(1), Some(true));
        assert_eq!(status.flag(3), None);
        assert_eq!(status.active_detectors(), vec![1, 2]);
        assert!(!status.is_error());

        assert_eq!(Status::Error.flag(0), None);
        assert!(Status::Error.active_detectors().is_empty());
    }

    #[test]
    fn test_frame_clone_is_independent() {
        let image = blank(Size::new(8, 6), CV_8UC3).unwrap();
        let frame = Frame::new(image, Instant::now());
        let copy = frame.try_clone().unwrap();

        assert_eq!(copy.resolution(), Resolution { width: 8, height: 6 });
        assert_eq!(copy.captured_at(), frame.captured_at());
        assert_ne!(copy.image().data(), frame.image().data());
    }

    #[test]
    fn test_encode_jpeg_produces_jfif() {
        let image = blank(Size::new(16, 16), CV_8UC3).unwrap();
        let jpeg = encode_jpeg(&image).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
