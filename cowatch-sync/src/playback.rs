//! Playback synchronizer with echo suppression.
//!
//! A playback engine reports *that* play/pause/seek happened, never *who*
//! caused it. Applying a peer's command therefore produces an engine event
//! that looks exactly like a user action, and re-broadcasting it would start
//! an echo loop between peers.
//!
//! ```text
//! remote command ──► apply_remote() ──► arm token ──► engine.play()/pause()/seek()
//!                                          │
//! engine callback ──► on_local_playback_event()
//!                          │
//!                          ├── pending token of same kind? ──► consume, Suppressed
//!                          └── otherwise ──► CommandEvent ──► EventSink, Emitted
//! ```
//!
//! Each applied command arms one correlation token carrying its kind and a
//! deadline. The first engine event of the same kind within the window
//! consumes it. Events of other kinds pass through untouched, so an unrelated
//! user action delivered between the mutation and its callback is still
//! broadcast, and a token whose callback never arrives expires instead of
//! swallowing a later genuine event.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::channel::EventSink;
use crate::error::SyncError;
use crate::protocol::{sanitize_timestamp, CommandEvent, CommandKind, Event, UserId};

/// Upper bound on armed, not yet consumed tokens.
pub const MAX_PENDING_APPLIES: usize = 8;

/// The local media player, driven and observed by the synchronizer.
pub trait PlaybackEngine {
    fn play(&mut self);
    fn pause(&mut self);
    /// Set the current position, in seconds.
    fn seek(&mut self, position: f64);
    fn position(&self) -> f64;
    fn is_paused(&self) -> bool;
}

/// Correlates one applied remote command with the engine event it causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuppressionToken(u64);

impl SuppressionToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingApply {
    token: SuppressionToken,
    kind: CommandKind,
    deadline: Instant,
}

/// Last playback state observed locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSnapshot {
    pub position: f64,
    pub paused: bool,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            position: 0.0,
            paused: true,
        }
    }
}

/// What happened to a local engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalOutcome {
    /// Caused by an applied remote command; nothing was sent.
    Suppressed(SuppressionToken),
    /// Genuine local change; this command was sent.
    Emitted(CommandEvent),
}

/// Keeps the local engine in step with peer commands without echoing them.
pub struct PlaybackSynchronizer<P, S> {
    local_user: UserId,
    engine: P,
    sink: S,
    window: Duration,
    pending: VecDeque<PendingApply>,
    next_token: u64,
    last_known: PlaybackSnapshot,
}

impl<P: PlaybackEngine, S: EventSink> PlaybackSynchronizer<P, S> {
    pub fn new(local_user: UserId, engine: P, sink: S, window: Duration) -> Self {
        let last_known = PlaybackSnapshot {
            position: sanitize_timestamp(engine.position()),
            paused: engine.is_paused(),
        };
        Self {
            local_user,
            engine,
            sink,
            window,
            pending: VecDeque::with_capacity(MAX_PENDING_APPLIES),
            next_token: 0,
            last_known,
        }
    }

    /// Apply a peer's command to the local engine. Never sends anything.
    pub fn apply_remote(&mut self, command: &CommandEvent) -> SuppressionToken {
        self.apply_remote_at(command, Instant::now())
    }

    pub fn apply_remote_at(&mut self, command: &CommandEvent, now: Instant) -> SuppressionToken {
        self.next_token += 1;
        let token = SuppressionToken(self.next_token);

        if self.pending.len() >= MAX_PENDING_APPLIES {
            if let Some(evicted) = self.pending.pop_front() {
                log::debug!("Evicting unconsumed suppression token {}", evicted.token.0);
            }
        }
        // Armed before the mutation: engines may fire their callback synchronously.
        self.pending.push_back(PendingApply {
            token,
            kind: command.kind,
            deadline: now + self.window,
        });

        match command.kind {
            CommandKind::Play => self.engine.play(),
            CommandKind::Pause => self.engine.pause(),
            CommandKind::Seeked => self.engine.seek(command.timestamp),
        }

        log::debug!(
            "Applied remote {} at {:.3}s from {} (token {})",
            command.kind,
            command.timestamp,
            command
                .user_id
                .as_ref()
                .map_or("relay", |user| user.as_str()),
            token.0
        );
        token
    }

    /// Handle an engine callback (play started, paused, seek completed).
    pub fn on_local_playback_event(
        &mut self,
        kind: CommandKind,
        timestamp: f64,
    ) -> Result<LocalOutcome, SyncError> {
        self.on_local_playback_event_at(kind, timestamp, Instant::now())
    }

    pub fn on_local_playback_event_at(
        &mut self,
        kind: CommandKind,
        timestamp: f64,
        now: Instant,
    ) -> Result<LocalOutcome, SyncError> {
        let timestamp = sanitize_timestamp(timestamp);
        self.observe(kind, timestamp);

        let before = self.pending.len();
        self.pending.retain(|p| p.deadline >= now);
        if self.pending.len() < before {
            log::debug!("{} suppression token(s) expired", before - self.pending.len());
        }

        if let Some(index) = self.pending.iter().position(|p| p.kind == kind) {
            if let Some(consumed) = self.pending.remove(index) {
                log::trace!("Suppressed local {kind} (token {})", consumed.token.0);
                return Ok(LocalOutcome::Suppressed(consumed.token));
            }
        }

        let command = CommandEvent::new(Some(self.local_user.clone()), kind, timestamp);
        self.sink.send(&Event::Command(command.clone()))?;
        log::debug!("Sent local {kind} at {timestamp:.3}s");
        Ok(LocalOutcome::Emitted(command))
    }

    fn observe(&mut self, kind: CommandKind, timestamp: f64) {
        self.last_known.position = timestamp;
        match kind {
            CommandKind::Play => self.last_known.paused = false,
            CommandKind::Pause => self.last_known.paused = true,
            CommandKind::Seeked => {}
        }
    }

    /// Whether any applied command is still waiting for its engine callback.
    pub fn is_armed(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Last locally observed playback state, kept across connection loss.
    pub fn last_known(&self) -> PlaybackSnapshot {
        self.last_known
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn engine(&self) -> &P {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut P {
        &mut self.engine
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
