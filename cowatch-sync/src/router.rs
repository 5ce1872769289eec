//! Inbound event dispatch.
//!
//! Every frame received on the session channel goes through
//! [`MessageRouter::route`]: chat events land in the [`ChatLog`], commands
//! from other users are applied by the [`PlaybackSynchronizer`], and anything
//! unparseable is logged and dropped.

use crate::channel::EventSink;
use crate::chat::{ChatLog, ChatLogEntry};
use crate::playback::{PlaybackEngine, PlaybackSynchronizer, SuppressionToken};
use crate::protocol::{ChatEvent, CommandEvent, Event, ProtocolError, UserId};

/// Classification of one inbound frame.
#[derive(Debug)]
pub enum Route {
    Chat(ChatEvent),
    Command(CommandEvent),
    /// The local user's own event, delivered back by the relay.
    SelfOrigin(Event),
    Malformed(ProtocolError),
}

/// What routing did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Chat entry appended to the log.
    Appended,
    /// Chat entry already in the log.
    DuplicateChat,
    /// Remote command applied to the engine.
    Applied(SuppressionToken),
    /// Own event echoed back; ignored.
    SelfOrigin,
    /// Unparseable or unknown frame; dropped.
    Dropped,
}

/// Routes inbound frames for one local user.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    local_user: UserId,
}

impl MessageRouter {
    pub fn new(local_user: UserId) -> Self {
        Self { local_user }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Parse and classify a frame without side effects.
    pub fn classify(&self, raw: &str) -> Route {
        let event = match Event::decode(raw) {
            Ok(event) => event,
            Err(e) => return Route::Malformed(e),
        };

        match event {
            Event::Command(cmd) if cmd.user_id.as_ref() == Some(&self.local_user) => {
                Route::SelfOrigin(Event::Command(cmd))
            }
            // Without an id an own message cannot be told apart from its echo
            Event::Chat(chat) if chat.id.is_none() && chat.author_id == self.local_user => {
                Route::SelfOrigin(Event::Chat(chat))
            }
            Event::Command(cmd) => Route::Command(cmd),
            Event::Chat(chat) => Route::Chat(chat),
        }
    }

    /// Classify a frame and dispatch it. Never fails.
    pub fn route<P, S>(
        &self,
        raw: &str,
        chat: &mut ChatLog,
        playback: &mut PlaybackSynchronizer<P, S>,
    ) -> RouteOutcome
    where
        P: PlaybackEngine,
        S: EventSink,
    {
        match self.classify(raw) {
            Route::Chat(event) => {
                if chat.append(ChatLogEntry::from(event)) {
                    RouteOutcome::Appended
                } else {
                    RouteOutcome::DuplicateChat
                }
            }
            Route::Command(cmd) => RouteOutcome::Applied(playback.apply_remote(&cmd)),
            Route::SelfOrigin(event) => {
                log::trace!("Ignoring own {} echoed back", event.type_tag());
                RouteOutcome::SelfOrigin
            }
            Route::Malformed(e) => {
                log::warn!("Dropping inbound frame: {e}");
                RouteOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemorySink;
    use crate::playback::PlaybackSnapshot;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingEngine {
        plays: usize,
        pauses: usize,
        seeks: Vec<f64>,
        position: f64,
    }

    impl PlaybackEngine for CountingEngine {
        fn play(&mut self) {
            self.plays += 1;
        }

        fn pause(&mut self) {
            self.pauses += 1;
        }

        fn seek(&mut self, position: f64) {
            self.position = position;
            self.seeks.push(position);
        }

        fn position(&self) -> f64 {
            self.position
        }

        fn is_paused(&self) -> bool {
            self.plays <= self.pauses
        }
    }

    struct Fixture {
        router: MessageRouter,
        chat: ChatLog,
        playback: PlaybackSynchronizer<CountingEngine, MemorySink>,
        sink: MemorySink,
    }

    fn fixture(user: &str) -> Fixture {
        let sink = MemorySink::new();
        Fixture {
            router: MessageRouter::new(UserId::from(user)),
            chat: ChatLog::new(UserId::from(user), "Local"),
            playback: PlaybackSynchronizer::new(
                UserId::from(user),
                CountingEngine::default(),
                sink.clone(),
                Duration::from_secs(1),
            ),
            sink,
        }
    }

    impl Fixture {
        fn route(&mut self, raw: &str) -> RouteOutcome {
            self.router.route(raw, &mut self.chat, &mut self.playback)
        }
    }

    #[test]
    fn test_chat_goes_to_log() {
        let mut f = fixture("B");
        let raw = r#"{"type":"message","author_id":"A","author":{"name":"Ann"},"message":"hello","id":"m1"}"#;

        assert_eq!(f.route(raw), RouteOutcome::Appended);
        assert_eq!(f.chat.len(), 1);
        assert_eq!(f.chat.entries()[0].author_name, "Ann");
    }

    #[test]
    fn test_remote_pause_applied_without_outgoing() {
        let mut f = fixture("B");
        let raw = r#"{"type":"command","userId":"A","commandType":"pause","timestamp":12.5}"#;

        assert!(matches!(f.route(raw), RouteOutcome::Applied(_)));
        assert_eq!(f.playback.engine().pauses, 1);
        assert!(f.sink.is_empty());

        // The engine then reports its pause; it must not go back out
        f.playback
            .on_local_playback_event(crate::protocol::CommandKind::Pause, 12.5)
            .unwrap();
        assert!(f.sink.is_empty());
    }

    #[test]
    fn test_own_command_not_reapplied() {
        let mut f = fixture("A");
        let raw = r#"{"type":"command","userId":"A","commandType":"play","timestamp":1.0}"#;

        assert_eq!(f.route(raw), RouteOutcome::SelfOrigin);
        assert_eq!(f.playback.engine().plays, 0);
        assert!(!f.playback.is_armed());
    }

    #[test]
    fn test_own_chat_echo_not_appended_twice() {
        let mut f = fixture("A");
        let sink = f.sink.clone();
        f.chat.author_and_send("hello", &sink).unwrap();

        let echoed = match &sink.sent()[0] {
            Event::Chat(chat) => Event::Chat(ChatEvent {
                timestamp: Some("2026-10-16T12:00:00Z".into()),
                ..chat.clone()
            }),
            other => panic!("expected chat, got {other:?}"),
        };

        let raw = echoed.encode().unwrap();
        assert_eq!(f.route(&raw), RouteOutcome::DuplicateChat);
        assert_eq!(f.chat.len(), 1);
    }

    #[test]
    fn test_own_chat_without_id_dropped() {
        let mut f = fixture("A");
        let raw = r#"{"type":"message","author_id":"A","message":"hi"}"#;
        assert_eq!(f.route(raw), RouteOutcome::SelfOrigin);
        assert!(f.chat.is_empty());
    }

    #[test]
    fn test_relay_replay_is_applied() {
        let mut f = fixture("A");
        let raw = r#"{"type":"command","userId":null,"commandType":"seeked","timestamp":61.0}"#;

        assert!(matches!(f.route(raw), RouteOutcome::Applied(_)));
        assert_eq!(f.playback.engine().seeks, vec![61.0]);
    }

    #[test]
    fn test_malformed_events_leave_state_unchanged() {
        let mut f = fixture("A");
        let before = f.playback.last_known();

        for raw in [
            "",
            "{",
            "null",
            r#"{"message":"no tag"}"#,
            r#"{"type":"reaction","emoji":"x"}"#,
            r#"{"type":"command","userId":"B","commandType":"stop","timestamp":1}"#,
            r#"{"type":"command","userId":"B","commandType":"seeked","timestamp":-1}"#,
            r#"{"type":"message","message":"missing author"}"#,
        ] {
            assert_eq!(f.route(raw), RouteOutcome::Dropped, "frame {raw:?}");
        }

        assert!(f.chat.is_empty());
        assert!(!f.playback.is_armed());
        assert_eq!(f.playback.engine().plays + f.playback.engine().pauses, 0);
        assert_eq!(f.playback.last_known(), before);
        assert_eq!(before, PlaybackSnapshot::default());
        assert!(f.sink.is_empty());
    }

    #[test]
    fn test_classify_unknown_type() {
        let router = MessageRouter::new(UserId::from("A"));
        match router.classify(r#"{"type":"typing"}"#) {
            Route::Malformed(ProtocolError::UnknownType(tag)) => assert_eq!(tag, "typing"),
            other => panic!("unexpected route {other:?}"),
        }
    }
}
