use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;

use crate::analytics::{DetectorFactory, DetectorStage};
use crate::camera::{CaptureStage, DeviceFactory};
use crate::frame::{CompositeFrame, DetectorResult, Frame, Resolution};
use crate::relay::{Command, Control, Relay};

use super::{OutputStage, PipelineEvent, PipelineSettings};

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn {stage} worker: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

struct Worker {
    name: String,
    control: Control,
    handle: JoinHandle<()>,
}

struct PipelineState {
    workers: Vec<Worker>,
    events: Receiver<PipelineEvent>,
    resolution: Option<Resolution>,
}

/// Owns the lifecycle of the capture, detector and output workers.
pub struct Supervisor {
    settings: PipelineSettings,
    device_factory: DeviceFactory,
    detectors: Vec<Arc<dyn DetectorFactory>>,
    outputs: Vec<Relay<CompositeFrame>>,
    state: Option<PipelineState>,
}

impl Supervisor {
    pub fn new(
        settings: PipelineSettings,
        device_factory: DeviceFactory,
        detectors: Vec<Arc<dyn DetectorFactory>>,
        outputs: Vec<Relay<CompositeFrame>>,
    ) -> Self {
        Self {
            settings,
            device_factory,
            detectors,
            outputs,
            state: None,
        }
    }

    /// Spawns a fresh set of workers and channels. A pipeline that is
    /// already running is closed first.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state.is_some() {
            self.close();
        }
        tracing::info!(detectors = self.detectors.len(), "starting camera pipeline");

        let (event_tx, events) = unbounded();
        let source_relay = Relay::new(self.settings.source_retain);
        let detector_inputs: Vec<Relay<Frame>> = self
            .detectors
            .iter()
            .map(|_| Relay::new(self.settings.source_retain))
            .collect();
        let detector_results: Vec<Relay<DetectorResult>> = self
            .detectors
            .iter()
            .map(|_| Relay::new(self.settings.result_retain))
            .collect();

        let mut state = PipelineState {
            workers: Vec::with_capacity(self.detectors.len() + 2),
            events,
            resolution: None,
        };

        let spawned = self.spawn_workers(
            &mut state,
            event_tx,
            source_relay,
            detector_inputs,
            detector_results,
        );
        self.state = Some(state);

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start camera pipeline");
            self.close();
            return Err(e);
        }
        Ok(())
    }

    fn spawn_workers(
        &self,
        state: &mut PipelineState,
        event_tx: Sender<PipelineEvent>,
        source_relay: Relay<Frame>,
        detector_inputs: Vec<Relay<Frame>>,
        detector_results: Vec<Relay<DetectorResult>>,
    ) -> Result<(), PipelineError> {
        let control = Control::new();
        let capture = CaptureStage::new(
            (self.device_factory)(),
            self.settings.clone(),
            detector_inputs.clone(),
            source_relay.clone(),
            control.clone(),
            event_tx,
        );
        state
            .workers
            .push(spawn_worker("capture".into(), control, move || capture.run())?);

        let control = Control::new();
        let output = OutputStage::new(
            self.settings.clone(),
            source_relay,
            detector_results.clone(),
            self.outputs.clone(),
            control.clone(),
        );
        state
            .workers
            .push(spawn_worker("compositor".into(), control, move || output.run())?);

        for (index, ((factory, input), result)) in self
            .detectors
            .iter()
            .zip(detector_inputs)
            .zip(detector_results)
            .enumerate()
        {
            let control = Control::new();
            let stage = DetectorStage::new(index, Arc::clone(factory), input, result, control.clone());
            state.workers.push(spawn_worker(
                format!("detector-{index}"),
                control,
                move || stage.run(),
            )?);
        }

        Ok(())
    }

    /// Stops every worker and waits up to the shutdown timeout for them to
    /// exit. Workers that do not acknowledge in time are detached.
    pub fn close(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        tracing::info!("stopping camera pipeline");

        for worker in &state.workers {
            worker.control.clear();
            worker.control.send(Command::Stop);
        }

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        let mut stopped = true;
        for worker in state.workers {
            while !worker.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }

            if !worker.handle.is_finished() {
                tracing::warn!(stage = %worker.name, "worker did not stop in time, detaching");
                stopped = false;
                continue;
            }
            if worker.handle.join().is_err() {
                tracing::error!(stage = %worker.name, "worker panicked");
            }
        }

        if stopped {
            tracing::info!("camera pipeline stopped");
        }
    }

    /// Applies pending capture reports. A failed source tears the whole
    /// pipeline down.
    pub fn poll(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let mut failed = None;
        for event in state.events.try_iter() {
            match event {
                PipelineEvent::Opened(info) => state.resolution = Some(info.resolution),
                PipelineEvent::SourceFailed { reason } => failed = Some(reason),
            }
        }

        if let Some(reason) = failed {
            tracing::error!(reason = %reason, "capture source failed, tearing pipeline down");
            self.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// Last resolution reported by the capture stage, `None` until the
    /// device has opened.
    pub fn resolution(&mut self) -> Option<Resolution> {
        self.poll();
        self.state.as_ref().and_then(|state| state.resolution)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_worker<F>(name: String, control: Control, body: F) -> Result<Worker, PipelineError>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| PipelineError::Spawn {
            stage: name.clone(),
            source,
        })?;

    Ok(Worker {
        name,
        control,
        handle,
    })
}
