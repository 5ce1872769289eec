//! Client-side session context.
//!
//! [`WatchSession`] owns the per-client state (chat log, playback
//! synchronizer, router) and is driven from a single loop: inbound frames,
//! local chat input and engine callbacks all go through `&mut self`, so no
//! locking is involved.

use std::time::Duration;

use crate::channel::{EventSink, Identity};
use crate::chat::{ChatLog, ChatLogEntry};
use crate::error::SyncError;
use crate::playback::{LocalOutcome, PlaybackEngine, PlaybackSnapshot, PlaybackSynchronizer};
use crate::protocol::{CommandKind, SessionId};
use crate::router::{MessageRouter, RouteOutcome};

pub struct WatchSession<P, S> {
    session_id: SessionId,
    router: MessageRouter,
    chat: ChatLog,
    playback: PlaybackSynchronizer<P, S>,
}

impl<P, S> WatchSession<P, S>
where
    P: PlaybackEngine,
    S: EventSink + Clone,
{
    /// `sink` is shared by chat and playback; it only needs send capability.
    pub fn new(
        session_id: SessionId,
        identity: &Identity,
        engine: P,
        sink: S,
        suppression_window: Duration,
    ) -> Self {
        Self {
            session_id,
            router: MessageRouter::new(identity.user_id.clone()),
            chat: ChatLog::new(identity.user_id.clone(), identity.display_name.clone()),
            playback: PlaybackSynchronizer::new(
                identity.user_id.clone(),
                engine,
                sink,
                suppression_window,
            ),
        }
    }

    /// Route one inbound frame.
    pub fn handle_inbound(&mut self, raw: &str) -> RouteOutcome {
        self.router.route(raw, &mut self.chat, &mut self.playback)
    }

    /// Author a chat message: shown locally at once, then sent.
    pub fn send_chat(&mut self, text: impl Into<String>) -> Result<ChatLogEntry, SyncError> {
        let sink = self.playback.sink().clone();
        self.chat.author_and_send(text, &sink)
    }

    /// Feed an engine callback through echo suppression.
    pub fn on_local_playback_event(
        &mut self,
        kind: CommandKind,
        timestamp: f64,
    ) -> Result<LocalOutcome, SyncError> {
        self.playback.on_local_playback_event(kind, timestamp)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn playback(&self) -> &PlaybackSynchronizer<P, S> {
        &self.playback
    }

    pub fn playback_mut(&mut self) -> &mut PlaybackSynchronizer<P, S> {
        &mut self.playback
    }

    pub fn engine_mut(&mut self) -> &mut P {
        self.playback.engine_mut()
    }

    pub fn last_known(&self) -> PlaybackSnapshot {
        self.playback.last_known()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemorySink;
    use crate::protocol::{CommandEvent, Event, UserId};

    /// Engine that queues the callbacks a real player would fire.
    #[derive(Default)]
    struct QueueingEngine {
        position: f64,
        paused: bool,
        fired: Vec<(CommandKind, f64)>,
    }

    impl PlaybackEngine for QueueingEngine {
        fn play(&mut self) {
            self.paused = false;
            self.fired.push((CommandKind::Play, self.position));
        }

        fn pause(&mut self) {
            self.paused = true;
            self.fired.push((CommandKind::Pause, self.position));
        }

        fn seek(&mut self, position: f64) {
            self.position = position;
            self.fired.push((CommandKind::Seeked, position));
        }

        fn position(&self) -> f64 {
            self.position
        }

        fn is_paused(&self) -> bool {
            self.paused
        }
    }

    fn session(user: &str) -> (WatchSession<QueueingEngine, MemorySink>, MemorySink) {
        let sink = MemorySink::new();
        let identity = Identity::new(user, format!("User {user}"), "");
        let session = WatchSession::new(
            SessionId::from("s1"),
            &identity,
            QueueingEngine::default(),
            sink.clone(),
            Duration::from_secs(1),
        );
        (session, sink)
    }

    fn flush_engine(session: &mut WatchSession<QueueingEngine, MemorySink>) -> Vec<LocalOutcome> {
        let fired = std::mem::take(&mut session.engine_mut().fired);
        fired
            .into_iter()
            .map(|(kind, ts)| session.on_local_playback_event(kind, ts).unwrap())
            .collect()
    }

    /// Relay every frame in `from` to `to`, returning how many were delivered.
    fn relay(from: &MemorySink, already: usize, to: &mut WatchSession<QueueingEngine, MemorySink>) -> usize {
        let sent = from.sent();
        for event in &sent[already..] {
            to.handle_inbound(&event.encode().unwrap());
        }
        sent.len()
    }

    #[test]
    fn test_no_echo_loop_between_two_peers() {
        let (mut a, a_out) = session("A");
        let (mut b, b_out) = session("B");

        // A's user seeks and presses play
        a.engine_mut().seek(30.0);
        a.engine_mut().play();
        flush_engine(&mut a);
        assert_eq!(a_out.len(), 2);

        // B applies both and its engine reports them back
        relay(&a_out, 0, &mut b);
        let outcomes = flush_engine(&mut b);
        assert!(outcomes.iter().all(|o| matches!(o, LocalOutcome::Suppressed(_))));
        assert!(b_out.is_empty(), "B must not re-broadcast A's commands");
        assert_eq!(b.engine_mut().position, 30.0);
        assert!(!b.engine_mut().paused);
    }

    #[test]
    fn test_send_chat_is_local_first() {
        let (mut a, a_out) = session("A");
        a.send_chat("hello").unwrap();

        assert_eq!(a.chat().len(), 1);
        assert_eq!(a.chat().entries()[0].author_id, UserId::from("A"));
        assert_eq!(a.chat().entries()[0].message, "hello");
        assert_eq!(a_out.len(), 1);

        // The relay echoes it back to A
        let echo = a_out.sent()[0].encode().unwrap();
        assert_eq!(a.handle_inbound(&echo), RouteOutcome::DuplicateChat);
        assert_eq!(a.chat().len(), 1);
    }

    #[test]
    fn test_chat_reaches_peer() {
        let (mut a, a_out) = session("A");
        let (mut b, _b_out) = session("B");
        a.send_chat("hi B").unwrap();
        relay(&a_out, 0, &mut b);

        let entry = &b.chat().entries()[0];
        assert_eq!(entry.author_name, "User A");
        assert!(!entry.is_own(&UserId::from("B")));
    }

    #[test]
    fn test_state_kept_after_channel_loss() {
        let (mut a, a_out) = session("A");
        a.send_chat("before").unwrap();
        a.on_local_playback_event(CommandKind::Pause, 12.0).unwrap();

        a_out.close();
        assert!(a.send_chat("after").is_err());
        assert!(a.on_local_playback_event(CommandKind::Play, 12.0).is_err());

        assert_eq!(a.chat().len(), 2);
        assert_eq!(a.last_known().position, 12.0);
    }

    #[test]
    fn test_remote_command_from_unknown_peer_applies() {
        let (mut b, b_out) = session("B");
        let cmd: Event = CommandEvent::new(Some(UserId::from("Z")), CommandKind::Seeked, 8.0).into();
        assert!(matches!(
            b.handle_inbound(&cmd.encode().unwrap()),
            RouteOutcome::Applied(_)
        ));
        flush_engine(&mut b);
        assert!(b_out.is_empty());
        assert_eq!(b.session_id().as_str(), "s1");
    }
}
