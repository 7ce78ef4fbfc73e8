use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use opencv::core::Mat;

use crate::frame::Frame;
use crate::pipeline::{pace, PipelineEvent, PipelineSettings};
use crate::relay::{Command, Control, Relay};

use super::{CameraError, CaptureDevice, DeviceInfo};

#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Reopen,
    Stop,
}

enum Recovery {
    Reopened,
    Stopped,
    GaveUp,
}

/// Owns the capture device and paces reads to the target frame rate.
pub struct CaptureStage {
    device: Box<dyn CaptureDevice>,
    settings: PipelineSettings,
    detector_relays: Vec<Relay<Frame>>,
    output_relay: Relay<Frame>,
    control: Control,
    events: Sender<PipelineEvent>,
    opened_at: Instant,
    warming_up: bool,
    failures: u32,
}

impl CaptureStage {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        settings: PipelineSettings,
        detector_relays: Vec<Relay<Frame>>,
        output_relay: Relay<Frame>,
        control: Control,
        events: Sender<PipelineEvent>,
    ) -> Self {
        Self {
            device,
            settings,
            detector_relays,
            output_relay,
            control,
            events,
            opened_at: Instant::now(),
            warming_up: true,
            failures: 0,
        }
    }

    pub fn run(mut self) {
        tracing::info!("capture stage started");

        if let Err(e) = self.open() {
            tracing::error!(error = %e, "capture device failed to start");
            self.drain_outputs();
            self.report(PipelineEvent::SourceFailed {
                reason: e.to_string(),
            });
            return;
        }

        let budget = self.settings.frame_budget();
        loop {
            let started = Instant::now();
            match self.tick(started) {
                Tick::Continue => {}
                Tick::Stop => break,
                Tick::Reopen => match self.recover() {
                    Recovery::Reopened => continue,
                    Recovery::Stopped => break,
                    Recovery::GaveUp => {
                        self.report(PipelineEvent::SourceFailed {
                            reason: "capture device could not be reopened".into(),
                        });
                        break;
                    }
                },
            }
            pace(started, budget);
        }

        self.device.release();
        self.drain_outputs();
        tracing::info!("capture stage stopped");
    }

    pub fn open(&mut self) -> Result<DeviceInfo, CameraError> {
        let info = self.device.open()?;
        tracing::info!(
            width = info.resolution.width,
            height = info.resolution.height,
            input_fps = info.fps,
            output_fps = self.settings.fps,
            "capture device opened"
        );

        self.opened_at = Instant::now();
        self.warming_up = true;
        self.failures = 0;
        self.report(PipelineEvent::Opened(info));
        Ok(info)
    }

    /// One loop iteration without pacing.
    pub fn tick(&mut self, now: Instant) -> Tick {
        if let Some(Command::Stop) = self.control.poll() {
            return Tick::Stop;
        }

        match self.device.read() {
            Ok(image) => {
                self.failures = 0;
                self.fan_out(image, now);
                Tick::Continue
            }
            Err(e) => {
                self.failures += 1;
                tracing::warn!(error = %e, failures = self.failures, "failed to read frame");
                if self.failures > 1 {
                    Tick::Reopen
                } else {
                    Tick::Continue
                }
            }
        }
    }

    fn fan_out(&mut self, image: Mat, now: Instant) {
        if self.warming_up && now.saturating_duration_since(self.opened_at) >= self.settings.warmup
        {
            self.warming_up = false;
            tracing::debug!("capture warm-up finished");
        }

        let frame = Frame::new(image, now);
        if !self.warming_up {
            for relay in &self.detector_relays {
                match frame.try_clone() {
                    Ok(copy) => relay.send(copy),
                    Err(e) => tracing::warn!(error = %e, "failed to copy frame for detector"),
                }
            }
        }
        self.output_relay.send(frame);
    }

    /// Keeps reopening the device until it works, a stop arrives, or the
    /// configured attempt budget runs out.
    fn recover(&mut self) -> Recovery {
        let mut attempts = 0u32;
        loop {
            self.device.release();
            if let Some(Command::Stop) = self.control.wait(self.settings.reopen_delay) {
                return Recovery::Stopped;
            }

            attempts += 1;
            tracing::info!(attempt = attempts, "reopening capture device");
            match self.open() {
                Ok(_) => return Recovery::Reopened,
                Err(e) => {
                    tracing::error!(attempt = attempts, error = %e, "failed to reopen capture device");
                    if let Some(max) = self.settings.max_reopen_attempts {
                        if attempts >= max {
                            return Recovery::GaveUp;
                        }
                    }
                }
            }
        }
    }

    fn drain_outputs(&self) {
        for relay in &self.detector_relays {
            relay.drain();
        }
        self.output_relay.drain();
    }

    fn report(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("supervisor no longer listening for pipeline events");
        }
    }
}
