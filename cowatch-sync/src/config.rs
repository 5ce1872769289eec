//! Client and relay configuration.

use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;

/// Path prefix under which the relay accepts session channels.
pub const JOIN_PATH_PREFIX: &str = "/api/v1/session/ws/join_session/";

/// Handshake header carrying the local user identifier.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Everything but RFC 3986 unreserved characters is escaped in a session segment.
const SESSION_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Escape a session id for use as a single path segment.
pub fn encode_session_segment(session_id: &str) -> String {
    utf8_percent_encode(session_id, SESSION_SEGMENT).to_string()
}

/// Reverse of [`encode_session_segment`]. `None` if the segment is not UTF-8.
pub fn decode_session_segment(segment: &str) -> Option<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|id| id.into_owned())
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:8090`
    pub server_url: String,
    /// How long an applied remote command may wait for its engine callback
    pub suppression_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8090".to_string(),
            suppression_window_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }

    /// Channel URL for a session.
    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}{}{}",
            self.server_url.trim_end_matches('/'),
            JOIN_PATH_PREFIX,
            encode_session_segment(session_id)
        )
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous channels per session
    pub max_members_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Chat messages replayed to a late joiner
    pub chat_backfill: usize,
    /// Deliver events back to their sender as well
    pub echo_to_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8090".to_string(),
            max_members_per_session: 100,
            broadcast_capacity: 256,
            chat_backfill: 10,
            echo_to_sender: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:8090");
        assert_eq!(config.suppression_window(), Duration::from_secs(1));
    }

    #[test]
    fn test_session_url() {
        let config = ClientConfig {
            server_url: "ws://relay.local:9000/".to_string(),
            ..ClientConfig::default()
        };
        assert_eq!(
            config.session_url("abc"),
            "ws://relay.local:9000/api/v1/session/ws/join_session/abc"
        );
    }

    #[test]
    fn test_session_url_escapes_reserved_characters() {
        let config = ClientConfig::default();
        assert_eq!(
            config.session_url("room?other"),
            "ws://127.0.0.1:8090/api/v1/session/ws/join_session/room%3Fother"
        );
        assert!(config.session_url("my room").ends_with("/my%20room"));
        assert!(config.session_url("a#b").ends_with("/a%23b"));
        assert!(config.session_url("a/b").ends_with("/a%2Fb"));
        assert!(config.session_url("run-1_x.y~z").ends_with("/run-1_x.y~z"));
    }

    #[test]
    fn test_session_segment_decodes_back() {
        for id in ["room?other", "my room", "a#b", "a/b", "café", "plain"] {
            assert_eq!(
                decode_session_segment(&encode_session_segment(id)).as_deref(),
                Some(id)
            );
        }
        assert_eq!(decode_session_segment("%FF"), None);
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8090");
        assert_eq!(config.max_members_per_session, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.chat_backfill, 10);
        assert!(config.echo_to_sender);
    }

    #[test]
    fn test_relay_config_partial_deserialize() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"bind_addr":"0.0.0.0:80","echo_to_sender":false}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:80");
        assert!(!config.echo_to_sender);
        assert_eq!(config.chat_backfill, 10);
    }
}
