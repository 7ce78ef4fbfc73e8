//! Stage wiring: capture fans raw frames to the detector stages and the
//! compositor, the compositor fans annotated frames to every output relay.

mod compositor;
mod supervisor;

use std::thread;
use std::time::{Duration, Instant};

use crate::camera::DeviceInfo;
use crate::config::Config;

#[cfg(test)]
use compositor::Compositor;
pub use compositor::OutputStage;
pub use supervisor::Supervisor;

/// Reports from the capture stage to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Opened(DeviceInfo),
    SourceFailed { reason: String },
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fps: u32,
    pub warmup: Duration,
    pub reopen_delay: Duration,
    pub max_reopen_attempts: Option<u32>,
    pub detector_stale: Duration,
    pub source_stale: Duration,
    pub source_retain: usize,
    pub result_retain: usize,
    pub shutdown_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fps: config.capture.fps,
            warmup: Duration::from_secs(config.capture.warmup_secs),
            reopen_delay: Duration::from_millis(config.capture.reopen_delay_ms),
            max_reopen_attempts: config.capture.max_reopen_attempts,
            detector_stale: Duration::from_millis(config.pipeline.detector_stale_ms),
            source_stale: Duration::from_millis(config.pipeline.source_stale_ms),
            source_retain: config.pipeline.source_retain,
            result_retain: config.pipeline.result_retain,
            shutdown_timeout: Duration::from_millis(config.pipeline.shutdown_timeout_ms),
        }
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Sleeps out whatever is left of `budget` since `started`.
pub(crate) fn pace(started: Instant, budget: Duration) {
    let elapsed = started.elapsed();
    if elapsed < budget {
        thread::sleep(budget - elapsed);
    }
}
