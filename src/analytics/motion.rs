use std::collections::VecDeque;

use opencv::{
    core::{self, Mat, Point, Scalar, Size, Vector},
    imgproc,
    prelude::*,
};

use crate::config::MotionConfig;
use crate::frame::{blank_like, DetectorResult};

use super::{AnalyticsError, Detector, DetectorFactory};

const KERNEL_SIZE: Size = Size {
    width: 9,
    height: 4,
};
const DILATE_ITERATIONS: i32 = 2;

/// Frame differencing against a held background.
///
/// The background is only replaced when the scene is quiet, or when the
/// current frame also matches the frame from `history_depth` calls ago. A
/// change that persists for the whole history window is adopted as the new
/// scene; a passing object is not absorbed.
pub struct MotionDetector {
    config: MotionConfig,
    background: Mat,
    history: VecDeque<Mat>,
    kernel: Mat,
}

impl MotionDetector {
    pub fn new(first: &Mat, config: MotionConfig) -> Result<Self, AnalyticsError> {
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            KERNEL_SIZE,
            Point::new(-1, -1),
        )?;
        let background = prepare(first, config.blur_size)?;

        let mut history = VecDeque::with_capacity(config.history_depth);
        for _ in 0..config.history_depth {
            history.push_back(background.try_clone()?);
        }

        Ok(Self {
            config,
            background,
            history,
            kernel,
        })
    }

    #[cfg(test)]
    pub fn background(&self) -> &Mat {
        &self.background
    }

    fn contours(&self, current: &Mat, reference: &Mat) -> Result<Vector<Vector<Point>>, AnalyticsError> {
        let mut diff = Mat::default();
        core::absdiff(current, reference, &mut diff)?;

        let mut binary = Mat::default();
        imgproc::threshold(
            &diff,
            &mut binary,
            self.config.grayscale_threshold,
            255.0,
            imgproc::THRESH_BINARY,
        )?;

        let mut dilated = Mat::default();
        imgproc::dilate(
            &binary,
            &mut dilated,
            &self.kernel,
            Point::new(-1, -1),
            DILATE_ITERATIONS,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut found = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            &dilated,
            &mut found,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        let mut kept = Vector::<Vector<Point>>::new();
        for contour in found {
            if imgproc::contour_area(&contour, false)? > self.config.min_contour_area {
                kept.push(contour);
            }
        }
        Ok(kept)
    }
}

impl Detector for MotionDetector {
    fn detect(&mut self, frame: &Mat) -> Result<DetectorResult, AnalyticsError> {
        let current = prepare(frame, self.config.blur_size)?;
        let contours = self.contours(&current, &self.background)?;

        let oldest = match self.history.pop_front() {
            Some(oldest) => oldest,
            None => current.try_clone()?,
        };
        self.history.push_back(current.try_clone()?);

        if contours.is_empty() || self.contours(&current, &oldest)?.is_empty() {
            self.background = current;
        }

        let mut overlay = blank_like(frame)?;
        let color = Scalar::new(0.0, 255.0, 0.0, 0.0);
        for (i, contour) in contours.iter().enumerate() {
            let rect = imgproc::bounding_rect(&contour)?;
            imgproc::rectangle(&mut overlay, rect, color, 2, imgproc::LINE_8, 0)?;
            imgproc::put_text(
                &mut overlay,
                &format!("Difference {}", i + 1),
                Point::new(rect.x, rect.y - 4),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_8,
                false,
            )?;
        }

        Ok(DetectorResult {
            overlay,
            active: !contours.is_empty(),
        })
    }
}

/// Grayscale + box blur to suppress sensor noise.
fn prepare(frame: &Mat, blur_size: i32) -> Result<Mat, AnalyticsError> {
    let mut gray = Mat::default();
    imgproc::cvt_color_def(frame, &mut gray, imgproc::COLOR_BGR2GRAY)?;

    let mut blurred = Mat::default();
    imgproc::blur_def(&gray, &mut blurred, Size::new(blur_size, blur_size))?;
    Ok(blurred)
}

pub struct MotionDetectorFactory {
    config: MotionConfig,
}

impl MotionDetectorFactory {
    pub fn new(config: MotionConfig) -> Self {
        Self { config }
    }
}

impl DetectorFactory for MotionDetectorFactory {
    fn name(&self) -> &str {
        "motion"
    }

    fn create(&self, first_frame: &Mat) -> Result<Box<dyn Detector>, AnalyticsError> {
        Ok(Box::new(MotionDetector::new(
            first_frame,
            self.config.clone(),
        )?))
    }
}
