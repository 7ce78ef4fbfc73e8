use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::frame::{CompositeFrame, Status};
use crate::relay::Relay;

use super::snapshot::POLL_INTERVAL;
use super::{Snapshot, SnapshotStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmTransition {
    MotionStarted { detectors: Vec<usize> },
    MotionEnded,
    SignalLost,
    SignalRestored,
}

/// Edge detector over composite statuses.
#[derive(Debug, Default)]
pub struct ActivityMonitor {
    active: bool,
    signal_lost: bool,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, status: &Status) -> Vec<AlarmTransition> {
        let mut transitions = Vec::new();

        if status.is_error() {
            if !self.signal_lost {
                self.signal_lost = true;
                self.active = false;
                transitions.push(AlarmTransition::SignalLost);
            }
            return transitions;
        }

        if self.signal_lost {
            self.signal_lost = false;
            transitions.push(AlarmTransition::SignalRestored);
        }

        let detectors = status.active_detectors();
        match (self.active, detectors.is_empty()) {
            (false, false) => {
                self.active = true;
                transitions.push(AlarmTransition::MotionStarted { detectors });
            }
            (true, true) => {
                self.active = false;
                transitions.push(AlarmTransition::MotionEnded);
            }
            _ => {}
        }
        transitions
    }

    fn run(mut self, output: Relay<CompositeFrame>, evidence: SnapshotStore, shutdown: Arc<AtomicBool>) {
        tracing::info!("activity monitor started");

        while !shutdown.load(Ordering::Relaxed) {
            let Some(composite) = output.recv_timeout(POLL_INTERVAL) else {
                continue;
            };

            for transition in self.observe(&composite.status) {
                match transition {
                    AlarmTransition::MotionStarted { detectors } => {
                        tracing::info!(?detectors, "motion started");
                        match Snapshot::from_composite(&composite) {
                            Some(snapshot) => evidence.publish(snapshot),
                            None => tracing::warn!("failed to encode alarm frame"),
                        }
                    }
                    AlarmTransition::MotionEnded => tracing::info!("motion ended"),
                    AlarmTransition::SignalLost => tracing::warn!("camera signal lost"),
                    AlarmTransition::SignalRestored => tracing::info!("camera signal restored"),
                }
            }
        }

        output.drain();
        tracing::info!("activity monitor stopped");
    }
}

pub fn spawn_monitor(
    output: Relay<CompositeFrame>,
    evidence: SnapshotStore,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || ActivityMonitor::new().run(output, evidence, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::testing::solid_frame;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_motion_edges() {
        let mut monitor = ActivityMonitor::new();

        assert!(monitor.observe(&Status::Flags(vec![false, false])).is_empty());
        assert_eq!(
            monitor.observe(&Status::Flags(vec![false, true])),
            vec![AlarmTransition::MotionStarted { detectors: vec![1] }]
        );
        assert!(monitor.observe(&Status::Flags(vec![true, true])).is_empty());
        assert_eq!(
            monitor.observe(&Status::Flags(vec![false, false])),
            vec![AlarmTransition::MotionEnded]
        );
    }

    #[test]
    fn test_signal_loss_resets_motion() {
        let mut monitor = ActivityMonitor::new();
        monitor.observe(&Status::Flags(vec![true]));

        assert_eq!(monitor.observe(&Status::Error), vec![AlarmTransition::SignalLost]);
        assert!(monitor.observe(&Status::Error).is_empty());
        assert_eq!(
            monitor.observe(&Status::Flags(vec![true])),
            vec![
                AlarmTransition::SignalRestored,
                AlarmTransition::MotionStarted { detectors: vec![0] },
            ]
        );
    }

    #[test]
    fn test_motion_start_keeps_evidence() {
        let output = Relay::new(2);
        let evidence = SnapshotStore::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let (output, evidence, shutdown) = (output.clone(), evidence.clone(), Arc::clone(&shutdown));
            thread::spawn(move || ActivityMonitor::new().run(output, evidence, shutdown))
        };

        let composite = |status| CompositeFrame {
            frame: Frame::new(solid_frame(64, 48, 0.0), Instant::now()),
            status,
        };
        output.send(composite(Status::Flags(vec![false])));
        output.send(composite(Status::Flags(vec![true])));

        let deadline = Instant::now() + Duration::from_secs(2);
        while evidence.latest().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let snapshot = evidence.latest().unwrap();
        assert_eq!(snapshot.status, Status::Flags(vec![true]));
    }
}
