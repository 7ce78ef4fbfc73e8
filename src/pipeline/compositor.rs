use std::time::{Duration, Instant};

use chrono::Local;
use opencv::{
    core::{self, Mat, Point, Scalar},
    imgproc,
    prelude::*,
};

use crate::frame::{blank_like, CompositeFrame, DetectorResult, Frame, Status};
use crate::relay::{Command, Control, Relay};

use super::{pace, PipelineSettings};

const OVERLAY_WEIGHT: f64 = 0.5;
const FIRST_FRAME_POLL: Duration = Duration::from_millis(200);

struct OverlaySlot {
    overlay: Mat,
    active: bool,
    blanked: bool,
    updated_at: Instant,
}

/// Merges the live frame with the latest overlay of every detector.
pub struct Compositor {
    slots: Vec<OverlaySlot>,
    blank: Mat,
    placeholder: Mat,
    current: CompositeFrame,
    error_since: Option<Instant>,
    detector_stale: Duration,
    source_stale: Duration,
}

impl Compositor {
    /// Shapes all buffers after `first`; `now` seeds every detector's
    /// last-update time.
    pub fn new(
        first: &Mat,
        detectors: usize,
        settings: &PipelineSettings,
        now: Instant,
    ) -> opencv::Result<Self> {
        let blank = blank_like(first)?;
        let placeholder = no_signal_like(first)?;

        let mut slots = Vec::with_capacity(detectors);
        for _ in 0..detectors {
            slots.push(OverlaySlot {
                overlay: blank.try_clone()?,
                active: false,
                blanked: true,
                updated_at: now,
            });
        }

        let current = CompositeFrame {
            frame: Frame::new(placeholder.try_clone()?, now),
            status: Status::Flags(vec![false; detectors]),
        };

        Ok(Self {
            slots,
            blank,
            placeholder,
            current,
            error_since: None,
            detector_stale: settings.detector_stale,
            source_stale: settings.source_stale,
        })
    }

    #[cfg(test)]
    pub fn current(&self) -> &CompositeFrame {
        &self.current
    }

    /// Builds the composite for one output tick. `frame` is the newest
    /// captured frame, if any arrived since the last tick.
    pub fn step(
        &mut self,
        now: Instant,
        frame: Option<Frame>,
        results: &[Relay<DetectorResult>],
    ) -> opencv::Result<&CompositeFrame> {
        match frame {
            Some(frame) => self.compose(now, frame, results)?,
            None => self.on_missing_frame(now, results)?,
        }
        Ok(&self.current)
    }

    fn compose(
        &mut self,
        now: Instant,
        frame: Frame,
        results: &[Relay<DetectorResult>],
    ) -> opencv::Result<()> {
        self.error_since = None;

        let captured_at = frame.captured_at();
        let mut image = frame.into_image();
        if image.size()? != self.blank.size()? || image.typ() != self.blank.typ() {
            self.reshape(&image)?;
        }
        stamp_clock(&mut image)?;

        for (i, slot) in self.slots.iter_mut().enumerate() {
            let span = now.saturating_duration_since(slot.updated_at);
            match results.get(i).and_then(Relay::try_recv) {
                Some(result) => {
                    slot.overlay = result.overlay;
                    slot.active = result.active;
                    slot.blanked = false;
                    slot.updated_at = now;
                    annotate_span(&mut slot.overlay, i, span)?;
                }
                None if span > self.detector_stale && !slot.blanked => {
                    tracing::debug!(detector = i, span_ms = span.as_millis() as u64, "detector result stale");
                    slot.overlay = self.blank.try_clone()?;
                    slot.active = false;
                    slot.blanked = true;
                }
                None => {}
            }

            // A late result may still carry the previous frame size.
            if slot.overlay.size()? == image.size()? && slot.overlay.typ() == image.typ() {
                let mut blended = Mat::default();
                core::add_weighted(&image, 1.0, &slot.overlay, OVERLAY_WEIGHT, 0.0, &mut blended, -1)?;
                image = blended;
            }
        }

        self.current = CompositeFrame {
            frame: Frame::new(image, captured_at),
            status: Status::Flags(self.slots.iter().map(|slot| slot.active).collect()),
        };
        Ok(())
    }

    /// Re-shapes the buffers after the device came back at another size.
    /// Retained overlays are replaced with blanks of the new shape.
    fn reshape(&mut self, like: &Mat) -> opencv::Result<()> {
        tracing::info!(width = like.cols(), height = like.rows(), "frame size changed, reshaping compositor");
        self.blank = blank_like(like)?;
        self.placeholder = no_signal_like(like)?;
        for slot in &mut self.slots {
            slot.overlay = self.blank.try_clone()?;
        }
        Ok(())
    }

    fn on_missing_frame(
        &mut self,
        now: Instant,
        results: &[Relay<DetectorResult>],
    ) -> opencv::Result<()> {
        let Some(since) = self.error_since else {
            self.error_since = Some(now);
            return Ok(());
        };

        if now.saturating_duration_since(since) <= self.source_stale {
            return Ok(());
        }

        if !self.current.status.is_error() {
            tracing::debug!("failed to get source frame, showing placeholder");
        }
        self.current = CompositeFrame {
            frame: Frame::new(self.placeholder.try_clone()?, now),
            status: Status::Error,
        };
        for relay in results {
            relay.drain();
        }
        Ok(())
    }
}

fn no_signal_like(like: &Mat) -> opencv::Result<Mat> {
    let mut placeholder = blank_like(like)?;
    imgproc::put_text(
        &mut placeholder,
        "NO SIGNAL",
        Point::new(20, 15),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        Scalar::new(0.0, 0.0, 255.0, 0.0),
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(placeholder)
}

fn stamp_clock(image: &mut Mat) -> opencv::Result<()> {
    let text = Local::now().format("%Y/%m/%d %H:%M:%S").to_string();
    let origin = Point::new(4, image.rows() - 8);

    imgproc::put_text(
        image,
        &text,
        origin,
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        Scalar::all(255.0),
        2,
        imgproc::LINE_AA,
        false,
    )?;
    imgproc::put_text(
        image,
        &text,
        origin,
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        Scalar::all(0.0),
        1,
        imgproc::LINE_AA,
        false,
    )
}

fn annotate_span(overlay: &mut Mat, detector: usize, span: Duration) -> opencv::Result<()> {
    imgproc::put_text(
        overlay,
        &format!("span {}: {:.3}", detector, span.as_secs_f64()),
        Point::new(4, 13 + detector as i32 * 14),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        Scalar::new(0.0, 255.0, 0.0, 0.0),
        1,
        imgproc::LINE_8,
        false,
    )
}

/// Worker that paces the compositor and fans its output to every consumer.
pub struct OutputStage {
    settings: PipelineSettings,
    source: Relay<Frame>,
    results: Vec<Relay<DetectorResult>>,
    outputs: Vec<Relay<CompositeFrame>>,
    control: Control,
}

impl OutputStage {
    pub fn new(
        settings: PipelineSettings,
        source: Relay<Frame>,
        results: Vec<Relay<DetectorResult>>,
        outputs: Vec<Relay<CompositeFrame>>,
        control: Control,
    ) -> Self {
        Self {
            settings,
            source,
            results,
            outputs,
            control,
        }
    }

    pub fn run(self) {
        tracing::info!(detectors = self.results.len(), outputs = self.outputs.len(), "output stage started");

        if let Some(first) = self.wait_first_frame() {
            match Compositor::new(first.image(), self.results.len(), &self.settings, Instant::now()) {
                Ok(compositor) => self.compose_loop(compositor, first),
                Err(e) => tracing::error!(error = %e, "failed to set up compositor"),
            }
        }

        self.source.drain();
        for relay in &self.results {
            relay.drain();
        }
        for relay in &self.outputs {
            relay.drain();
        }
        tracing::info!("output stage stopped");
    }

    fn wait_first_frame(&self) -> Option<Frame> {
        loop {
            if let Some(Command::Stop) = self.control.poll() {
                return None;
            }
            if let Some(frame) = self.source.recv_timeout(FIRST_FRAME_POLL) {
                return Some(frame);
            }
        }
    }

    fn compose_loop(&self, mut compositor: Compositor, first: Frame) {
        let budget = self.settings.frame_budget();
        let mut pending = Some(first);

        loop {
            let started = Instant::now();
            if let Some(Command::Stop) = self.control.poll() {
                break;
            }

            let frame = pending.take().or_else(|| self.source.try_recv());
            match compositor.step(started, frame, &self.results) {
                Ok(composite) => self.publish(composite),
                Err(e) => tracing::warn!(error = %e, "failed to compose frame"),
            }

            pace(started, budget);
        }
    }

    fn publish(&self, composite: &CompositeFrame) {
        for relay in &self.outputs {
            match composite.try_clone() {
                Ok(copy) => relay.send(copy),
                Err(e) => tracing::warn!(error = %e, "failed to copy composite frame"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::solid_frame;
    use opencv::core::Vec3b;
    use std::thread;

    const W: i32 = 320;
    const H: i32 = 240;

    fn frame(at: Instant) -> Frame {
        Frame::new(solid_frame(W, H, 0.0), at)
    }

    fn result(value: f64, active: bool) -> DetectorResult {
        DetectorResult {
            overlay: solid_frame(W, H, value),
            active,
        }
    }

    fn probe(composite: &CompositeFrame) -> u8 {
        composite.frame.image().at_2d::<Vec3b>(120, 300).unwrap()[0]
    }

    fn setup(detectors: usize, now: Instant) -> (Compositor, Vec<Relay<DetectorResult>>) {
        let compositor = Compositor::new(
            &solid_frame(W, H, 0.0),
            detectors,
            &PipelineSettings::default(),
            now,
        )
        .unwrap();
        let results = (0..detectors).map(|_| Relay::new(2)).collect();
        (compositor, results)
    }

    #[test]
    fn test_overlays_blend_in_detector_order() {
        let t0 = Instant::now();
        let (mut compositor, results) = setup(2, t0);
        results[0].send(result(100.0, true));
        results[1].send(result(60.0, false));

        let composite = compositor.step(t0, Some(frame(t0)), &results).unwrap();

        assert_eq!(composite.status, Status::Flags(vec![true, false]));
        assert_eq!(probe(composite), 80);
    }

    #[test]
    fn test_stale_detector_is_blanked_alone() {
        let t0 = Instant::now();
        let (mut compositor, results) = setup(2, t0);
        results[0].send(result(100.0, true));
        results[1].send(result(60.0, true));
        compositor.step(t0, Some(frame(t0)), &results).unwrap();

        let mut now = t0;
        for _ in 0..12 {
            now += Duration::from_millis(100);
            results[0].send(result(100.0, true));
            compositor.step(now, Some(frame(now)), &results).unwrap();
        }

        let composite = compositor.current();
        assert_eq!(composite.status, Status::Flags(vec![true, false]));
        assert_eq!(probe(composite), 50);
    }

    #[test]
    fn test_recent_overlay_is_kept_without_new_result() {
        let t0 = Instant::now();
        let (mut compositor, results) = setup(1, t0);
        results[0].send(result(100.0, true));
        compositor.step(t0, Some(frame(t0)), &results).unwrap();

        let later = t0 + Duration::from_millis(500);
        let composite = compositor.step(later, Some(frame(later)), &results).unwrap();

        assert_eq!(composite.status, Status::Flags(vec![true]));
        assert_eq!(probe(composite), 50);
    }

    #[test]
    fn test_stalled_source_switches_to_placeholder() {
        let t0 = Instant::now();
        let (mut compositor, results) = setup(1, t0);
        results[0].send(result(100.0, true));
        compositor.step(t0, Some(frame(t0)), &results).unwrap();

        let first_miss = t0 + Duration::from_millis(100);
        let composite = compositor.step(first_miss, None, &results).unwrap();
        assert_eq!(composite.status, Status::Flags(vec![true]));

        results[0].send(result(100.0, true));
        let within_grace = first_miss + Duration::from_millis(1900);
        let composite = compositor.step(within_grace, None, &results).unwrap();
        assert!(!composite.status.is_error());

        let stalled = first_miss + Duration::from_millis(2100);
        let composite = compositor.step(stalled, None, &results).unwrap();
        assert_eq!(composite.status, Status::Error);
        assert_eq!(probe(composite), 0);
        assert!(results[0].is_empty());
    }

    #[test]
    fn test_error_clears_on_first_resumed_frame() {
        let t0 = Instant::now();
        let (mut compositor, results) = setup(1, t0);
        compositor.step(t0, Some(frame(t0)), &results).unwrap();
        compositor.step(t0 + Duration::from_millis(100), None, &results).unwrap();
        compositor.step(t0 + Duration::from_secs(3), None, &results).unwrap();
        assert!(compositor.current().status.is_error());

        let resumed = t0 + Duration::from_millis(3100);
        let composite = compositor.step(resumed, Some(frame(resumed)), &results).unwrap();
        assert_eq!(composite.status, Status::Flags(vec![false]));
    }

    #[test]
    fn test_resized_source_reshapes_placeholder() {
        let t0 = Instant::now();
        let (mut compositor, results) = setup(1, t0);
        results[0].send(result(100.0, true));
        compositor.step(t0, Some(frame(t0)), &results).unwrap();

        let resized = Frame::new(solid_frame(64, 48, 0.0), t0);
        let composite = compositor
            .step(t0 + Duration::from_millis(100), Some(resized), &results)
            .unwrap();
        assert_eq!(composite.frame.resolution().width, 64);
        assert_eq!(composite.status, Status::Flags(vec![true]));

        compositor.step(t0 + Duration::from_millis(200), None, &results).unwrap();
        let composite = compositor
            .step(t0 + Duration::from_secs(3), None, &results)
            .unwrap();
        assert_eq!(composite.status, Status::Error);
        assert_eq!(composite.frame.resolution().height, 48);
    }

    #[test]
    fn test_output_stage_fans_out_and_drains_on_stop() {
        let settings = PipelineSettings {
            fps: 50,
            ..PipelineSettings::default()
        };
        let source = Relay::new(2);
        let outputs: Vec<Relay<CompositeFrame>> = vec![Relay::new(2), Relay::new(2)];
        let control = Control::new();
        let stage = OutputStage::new(
            settings,
            source.clone(),
            vec![Relay::new(2)],
            outputs.clone(),
            control.clone(),
        );

        let handle = thread::spawn(move || stage.run());
        source.send(frame(Instant::now()));

        let first = outputs[0].recv_timeout(Duration::from_secs(2)).unwrap();
        let second = outputs[1].recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.status, Status::Flags(vec![false]));
        assert_eq!(second.frame.resolution(), first.frame.resolution());

        control.send(Command::Stop);
        handle.join().unwrap();
        assert!(outputs.iter().all(Relay::is_empty));
    }
}
