//! Per-document fan-out to every connected editor.
//!
//! One tokio broadcast channel per room; each connection holds its own
//! receiver buffering up to `capacity` frames. A receiver that falls further
//! behind than that sees `Lagged` and the dropped count is recorded.
//!
//! Who holds a seat in the room is the room's business, not the group's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, SyncMessage};

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    dropped: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: AtomicU64::new(0),
        }
    }

    /// A receiver for frames sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Encode once and send to every receiver, sender included.
    ///
    /// Filtering the sender out is the connection's job. Returns the number
    /// of receivers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.sender.send(encoded).unwrap_or(0)
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
