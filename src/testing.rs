//! Fakes for driving the pipeline without a camera.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use opencv::core::{Mat, Scalar, Size, Vec3b, CV_8UC3};
use opencv::prelude::*;

use crate::analytics::{AnalyticsError, Detector, DetectorFactory};
use crate::camera::{CameraError, CaptureDevice, DeviceFactory, DeviceInfo};
use crate::frame::{blank_like, DetectorResult, Frame, Resolution};

pub fn solid_frame(width: i32, height: i32, value: f64) -> Mat {
    Mat::new_size_with_default(Size::new(width, height), CV_8UC3, Scalar::all(value)).unwrap()
}

/// Frame whose pixels all carry `mark * 10`, so detectors can tell frames apart.
pub fn marked_frame(mark: u8, captured_at: Instant) -> Frame {
    Frame::new(solid_frame(64, 48, mark as f64 * 10.0), captured_at)
}

fn read_mark(frame: &Mat) -> Result<u8, AnalyticsError> {
    Ok(frame.at_2d::<Vec3b>(0, 0)?[0] / 10)
}

pub struct MarkerDetectorFactory {
    active_marks: Vec<u8>,
}

impl MarkerDetectorFactory {
    pub fn new(active_marks: Vec<u8>) -> Self {
        Self { active_marks }
    }
}

impl DetectorFactory for MarkerDetectorFactory {
    fn name(&self) -> &str {
        "marker"
    }

    fn create(&self, _first_frame: &Mat) -> Result<Box<dyn Detector>, AnalyticsError> {
        Ok(Box::new(MarkerDetector {
            active_marks: self.active_marks.clone(),
        }))
    }
}

struct MarkerDetector {
    active_marks: Vec<u8>,
}

impl Detector for MarkerDetector {
    fn detect(&mut self, frame: &Mat) -> Result<DetectorResult, AnalyticsError> {
        let mark = read_mark(frame)?;
        Ok(DetectorResult {
            overlay: blank_like(frame)?,
            active: self.active_marks.contains(&mark),
        })
    }
}

pub enum OpenScript {
    Always,
    Never,
    OnlyFirst,
}

pub struct ScriptedDevice {
    resolution: Resolution,
    open_script: OpenScript,
    reads: VecDeque<bool>,
    fail_all_reads: bool,
    opens: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    open_delay: Duration,
    is_open: bool,
    next_mark: u8,
}

impl ScriptedDevice {
    pub fn healthy(resolution: Resolution) -> Self {
        Self {
            resolution,
            open_script: OpenScript::Always,
            reads: VecDeque::new(),
            fail_all_reads: false,
            opens: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
            open_delay: Duration::ZERO,
            is_open: false,
            next_mark: 0,
        }
    }

    pub fn with_open_script(mut self, script: OpenScript) -> Self {
        self.open_script = script;
        self
    }

    /// `false` entries fail; once exhausted every read succeeds.
    pub fn with_reads(mut self, reads: &[bool]) -> Self {
        self.reads = reads.iter().copied().collect();
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_all_reads = true;
        self
    }

    /// Blocks every `open` for `delay`, ignoring stop requests.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }

    /// Counts releases of an open device.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.releases)
    }
}

impl CaptureDevice for ScriptedDevice {
    fn open(&mut self) -> Result<DeviceInfo, CameraError> {
        thread::sleep(self.open_delay);
        let previous = self.opens.fetch_add(1, Ordering::SeqCst);
        let allowed = match self.open_script {
            OpenScript::Always => true,
            OpenScript::Never => false,
            OpenScript::OnlyFirst => previous == 0,
        };
        if !allowed {
            return Err(CameraError::Unavailable("scripted".into()));
        }

        self.is_open = true;
        Ok(DeviceInfo {
            resolution: self.resolution,
            fps: 30.0,
        })
    }

    fn read(&mut self) -> Result<Mat, CameraError> {
        if !self.is_open {
            return Err(CameraError::NotOpen);
        }
        if self.fail_all_reads || !self.reads.pop_front().unwrap_or(true) {
            return Err(CameraError::EmptyFrame);
        }

        let mark = self.next_mark;
        self.next_mark = self.next_mark.wrapping_add(1) % 26;
        Ok(solid_frame(
            self.resolution.width,
            self.resolution.height,
            mark as f64 * 10.0,
        ))
    }

    fn release(&mut self) {
        if self.is_open {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        self.is_open = false;
    }
}

pub fn device_factory<F>(make: F) -> DeviceFactory
where
    F: Fn() -> ScriptedDevice + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn CaptureDevice>)
}
