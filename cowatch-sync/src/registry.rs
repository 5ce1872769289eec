//! Relay-side session registry and per-session state.
//!
//! Sessions are created by the external session workflow before anyone
//! joins; the relay only looks them up. Each [`SessionRoom`] keeps the last
//! playback intent and a short chat tail so late joiners can catch up.
//! Removing a session closes the room, which disconnects its members.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::{watch, Mutex};

use crate::broadcast::BroadcastGroup;
use crate::config::RelayConfig;
use crate::protocol::{ChatEvent, CommandEvent, CommandKind, Event, SessionId, UserId};

/// A user allowed into a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Member {
    pub id: UserId,
    pub display_name: String,
}

impl Member {
    /// Create a member with the name shown next to their chat messages.
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Last playback intent seen in a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackCache {
    /// Last `play` or `pause`; `None` if only seeks were seen.
    pub status: Option<CommandKind>,
    pub position: f64,
    pub updated_at: Instant,
}

impl PlaybackCache {
    fn new(now: Instant) -> Self {
        Self {
            status: None,
            position: 0.0,
            updated_at: now,
        }
    }

    /// Fold a command in: `play`/`pause` set the status, every kind sets the
    /// position and restarts the clock.
    pub fn record(&mut self, command: &CommandEvent, now: Instant) {
        match command.kind {
            CommandKind::Play | CommandKind::Pause => self.status = Some(command.kind),
            CommandKind::Seeked => {}
        }
        self.position = command.timestamp;
        self.updated_at = now;
    }

    /// Position at `now`, advancing the clock while playing.
    pub fn position_at(&self, now: Instant) -> f64 {
        match self.status {
            Some(CommandKind::Play) => {
                self.position + now.saturating_duration_since(self.updated_at).as_secs_f64()
            }
            _ => self.position,
        }
    }

    /// Commands that bring a newcomer to the current state: a seek to the
    /// current position, then the play/pause status.
    pub fn replay(&self, now: Instant) -> Vec<CommandEvent> {
        let position = self.position_at(now);
        let mut commands = vec![CommandEvent::new(None, CommandKind::Seeked, position)];
        if let Some(status) = self.status {
            commands.push(CommandEvent::new(None, status, position));
        }
        commands
    }
}

#[derive(Debug, Default)]
struct RoomState {
    playback: Option<PlaybackCache>,
    chat: VecDeque<ChatEvent>,
}

/// One shared-viewing session on the relay.
pub struct SessionRoom {
    id: SessionId,
    members: HashMap<UserId, Member>,
    broadcast: BroadcastGroup,
    state: Mutex<RoomState>,
    chat_backfill: usize,
    seats: AtomicUsize,
    closed: watch::Sender<bool>,
}

/// A reserved connection slot in a session, released on drop.
pub struct Seat {
    room: Arc<SessionRoom>,
}

impl Seat {
    /// The room this seat belongs to.
    pub fn room(&self) -> &Arc<SessionRoom> {
        &self.room
    }
}

impl Drop for Seat {
    fn drop(&mut self) {
        self.room.seats.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SessionRoom {
    fn new(id: SessionId, members: Vec<Member>, config: &RelayConfig) -> Self {
        Self {
            id,
            members: members.into_iter().map(|m| (m.id.clone(), m)).collect(),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            state: Mutex::new(RoomState::default()),
            chat_backfill: config.chat_backfill,
            seats: AtomicUsize::new(0),
            closed: watch::channel(false).0,
        }
    }

    /// Reserve one of `max` connection slots.
    pub fn try_take_seat(self: &Arc<Self>, max: usize) -> Option<Seat> {
        self.seats
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .ok()
            .map(|_| Seat { room: self.clone() })
    }

    /// Connections currently holding a seat.
    pub fn seats_taken(&self) -> usize {
        self.seats.load(Ordering::Acquire)
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// A session without a member list admits anyone.
    pub fn admits(&self, user: &UserId) -> bool {
        self.members.is_empty() || self.members.contains_key(user)
    }

    /// Registered display name of `user`, if the session lists members.
    pub fn display_name(&self, user: &UserId) -> Option<&str> {
        self.members.get(user).map(|m| m.display_name.as_str())
    }

    /// Fan-out group of the connected members.
    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Remember an accepted event for late joiners.
    pub async fn record(&self, event: &Event, now: Instant) {
        let mut state = self.state.lock().await;
        match event {
            Event::Command(cmd) => state
                .playback
                .get_or_insert_with(|| PlaybackCache::new(now))
                .record(cmd, now),
            Event::Chat(chat) => {
                if self.chat_backfill == 0 {
                    return;
                }
                if state.chat.len() >= self.chat_backfill {
                    state.chat.pop_front();
                }
                state.chat.push_back(chat.clone());
            }
        }
    }

    /// Events a newly joined member receives before live traffic.
    pub async fn backfill(&self, now: Instant) -> Vec<Event> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .playback
            .map(|cache| cache.replay(now))
            .unwrap_or_default()
            .into_iter()
            .map(Event::Command)
            .collect();
        events.extend(state.chat.iter().cloned().map(Event::Chat));
        events
    }

    /// Cached playback state, if any command was seen.
    pub async fn playback(&self) -> Option<PlaybackCache> {
        self.state.lock().await.playback
    }

    /// Disconnect every member. Idempotent.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            log::info!("Closing session {}", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Notified once when the room closes.
    pub fn closed_changes(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// All sessions known to the relay.
pub struct SessionRegistry {
    config: RelayConfig,
    sessions: RwLock<HashMap<SessionId, Arc<SessionRoom>>>,
}

impl SessionRegistry {
    /// Create an empty registry; rooms inherit `config`'s limits.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session. Returns the existing room if the id is taken.
    pub fn create(&self, id: SessionId, members: Vec<Member>) -> Arc<SessionRoom> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(&id) {
            log::debug!("Session {id} already registered");
            return existing.clone();
        }

        log::info!("Registered session {id} with {} member(s)", members.len());
        let room = Arc::new(SessionRoom::new(id.clone(), members, &self.config));
        sessions.insert(id, room.clone());
        room
    }

    /// Look up an open session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionRoom>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Unregister a session and close its room. Returns `false` if unknown.
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(room) => {
                room.close();
                true
            }
            None => false,
        }
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Settings shared by every room.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
