use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::frame::{encode_jpeg, CompositeFrame, Resolution, Status};
use crate::relay::Relay;

pub(super) const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A JPEG-encoded composite with the status it was published with.
#[derive(Clone)]
pub struct Snapshot {
    pub jpeg: Vec<u8>,
    pub status: Status,
    pub resolution: Resolution,
    pub taken_at: DateTime<Local>,
}

impl Snapshot {
    pub fn from_composite(composite: &CompositeFrame) -> Option<Self> {
        Some(Self {
            jpeg: encode_jpeg(composite.frame.image())?,
            status: composite.status.clone(),
            resolution: composite.frame.resolution(),
            taken_at: Local::now(),
        })
    }
}

/// Latest-value slot shared between a feed worker and the HTTP handlers.
#[derive(Clone, Default)]
pub struct SnapshotStore {
    latest: Arc<RwLock<Option<Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: Snapshot) {
        match self.latest.write() {
            Ok(mut latest) => *latest = Some(snapshot),
            Err(_) => tracing::error!("snapshot lock poisoned"),
        }
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.read().ok().and_then(|latest| latest.clone())
    }
}

fn run_preview_feed(output: Relay<CompositeFrame>, store: SnapshotStore, shutdown: Arc<AtomicBool>) {
    tracing::info!("preview feed started");

    while !shutdown.load(Ordering::Relaxed) {
        let Some(composite) = output.recv_timeout(POLL_INTERVAL) else {
            continue;
        };
        match Snapshot::from_composite(&composite) {
            Some(snapshot) => store.publish(snapshot),
            None => tracing::warn!("failed to encode preview frame"),
        }
    }

    output.drain();
    tracing::info!("preview feed stopped");
}

pub fn spawn_preview_feed(
    output: Relay<CompositeFrame>,
    store: SnapshotStore,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || run_preview_feed(output, store, shutdown))
}
