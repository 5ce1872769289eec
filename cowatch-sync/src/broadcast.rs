//! Fan-out of session events to every connected member.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a connection that falls further behind skips frames
//! and the skip is counted as dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{Event, ProtocolError, UserId};

/// Relay-local identifier of one accepted connection.
pub type ConnectionId = u64;

/// An encoded event together with the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// `None` for frames the relay originates itself.
    pub origin: Option<ConnectionId>,
    pub text: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_members: usize,
}

/// Atomic broadcast stats, so the send path never takes a lock.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,

    /// Connected members of this session
    members: Arc<RwLock<HashMap<ConnectionId, UserId>>>,

    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_member(
        &self,
        connection: ConnectionId,
        user: UserId,
    ) -> broadcast::Receiver<Arc<Frame>> {
        let mut members = self.members.write().await;
        members.insert(connection, user);
        self.sender.subscribe()
    }

    /// Drop a connection, returning the user it belonged to.
    pub async fn remove_member(&self, connection: ConnectionId) -> Option<UserId> {
        let mut members = self.members.write().await;
        members.remove(&connection)
    }

    /// Encode and broadcast an event to every member, the sender included.
    ///
    /// Returns the number of receivers; skipping the sender is the
    /// receiving connection's job.
    pub fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        event: &Event,
    ) -> Result<usize, ProtocolError> {
        let text = event.encode()?;
        Ok(self.broadcast_raw(Arc::new(Frame { origin, text })))
    }

    /// Broadcast a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.atomic_stats
            .frames_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    /// Number of open connections.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Users currently connected (one entry per connection).
    pub async fn members(&self) -> Vec<UserId> {
        self.members.read().await.values().cloned().collect()
    }

    /// Whether `user` holds at least one connection.
    pub async fn has_user(&self, user: &UserId) -> bool {
        self.members.read().await.values().any(|u| u == user)
    }

    /// Snapshot of frame counters and membership.
    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    /// Per-receiver buffer size before a member starts lagging.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Receiver for frames without registering a member.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }
}
