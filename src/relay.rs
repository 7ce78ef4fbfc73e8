//! Inter-stage channels.
//!
//! A [`Relay`] is a latest-value-biased queue: before every send the producer
//! evicts all but the `retain` newest unread items, so a slow consumer skips
//! frames instead of working through a backlog. [`Control`] carries
//! [`Command`]s on a separate channel so that stop requests never compete
//! with data.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

pub struct Relay<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    retain: usize,
}

impl<T> Relay<T> {
    /// `retain = 0` makes the relay a single-slot mailbox.
    pub fn new(retain: usize) -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx, retain }
    }

    pub fn send(&self, item: T) {
        while self.rx.len() > self.retain {
            if self.rx.try_recv().is_err() {
                break;
            }
        }
        // Cannot disconnect: this handle owns a receiver.
        let _ = self.tx.send(item);
    }

    /// Oldest retained item, without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Discards everything queued and returns how many items were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Single-slot mailbox: a send replaces whatever is still unread.
impl<T> Default for Relay<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> Clone for Relay<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            retain: self.retain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
}

/// Per-stage command channel. Both ends live in one handle so the
/// supervisor can clear residue before sending.
#[derive(Clone)]
pub struct Control {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl Control {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn send(&self, command: Command) {
        let _ = self.tx.send(command);
    }

    pub fn poll(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    /// Sleeps up to `timeout`, waking early when a command arrives.
    pub fn wait(&self, timeout: Duration) -> Option<Command> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}
