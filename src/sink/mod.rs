//! Consumers of the compositor's output relays.

mod alarm;
mod snapshot;

pub use alarm::spawn_monitor;
pub use snapshot::{spawn_preview_feed, Snapshot, SnapshotStore};
