//! Headless stand-in for a video player.
//!
//! Tracks position against the wall clock while playing and queues the
//! callbacks a real player would fire after each play, pause or seek, so the
//! caller can feed them back through echo suppression. Like a real player it
//! fires nothing for `play` while playing or `pause` while paused.

use std::collections::VecDeque;
use std::time::Instant;

use cowatch_sync::playback::PlaybackEngine;
use cowatch_sync::protocol::CommandKind;

pub struct VirtualPlayer {
    /// Position at `anchor`, in seconds.
    base: f64,
    /// Set while playing.
    anchor: Option<Instant>,
    fired: VecDeque<(CommandKind, f64)>,
}

impl VirtualPlayer {
    pub fn new() -> Self {
        Self {
            base: 0.0,
            anchor: None,
            fired: VecDeque::new(),
        }
    }

    /// Next callback the player would have fired, oldest first.
    pub fn next_callback(&mut self) -> Option<(CommandKind, f64)> {
        self.fired.pop_front()
    }

    fn position_at(&self, now: Instant) -> f64 {
        match self.anchor {
            Some(anchor) => self.base + now.duration_since(anchor).as_secs_f64(),
            None => self.base,
        }
    }
}

impl Default for VirtualPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackEngine for VirtualPlayer {
    fn play(&mut self) {
        if self.anchor.is_some() {
            return;
        }
        self.anchor = Some(Instant::now());
        self.fired.push_back((CommandKind::Play, self.base));
    }

    fn pause(&mut self) {
        if self.anchor.is_none() {
            return;
        }
        self.base = self.position_at(Instant::now());
        self.anchor = None;
        self.fired.push_back((CommandKind::Pause, self.base));
    }

    fn seek(&mut self, position: f64) {
        self.base = position.max(0.0);
        if self.anchor.is_some() {
            self.anchor = Some(Instant::now());
        }
        self.fired.push_back((CommandKind::Seeked, self.base));
    }

    fn position(&self) -> f64 {
        self.position_at(Instant::now())
    }

    fn is_paused(&self) -> bool {
        self.anchor.is_none()
    }
}
