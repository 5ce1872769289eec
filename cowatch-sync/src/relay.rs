//! WebSocket relay with session-scoped fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                    ┌──► Client A
//!            ├── /…/join_session/{id} ── SessionRoom ──► Client B
//! Client B ──┘        (handshake)      │    │     └──► Client C
//!                                      │    └── BroadcastGroup
//!                                      └── PlaybackCache + chat tail
//! ```
//!
//! The handshake names the session in its path and the user in the
//! `x-user-id` header; unknown sessions get HTTP 404 and non-members 403.
//! Accepted events are stamped with the connection's user and recorded for
//! late joiners before they are fanned out to the session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::ConnectionId;
use crate::config::{decode_session_segment, RelayConfig, JOIN_PATH_PREFIX, USER_ID_HEADER};
use crate::protocol::{Event, ProtocolError, SessionId, UserId};
use crate::registry::{Seat, SessionRegistry, SessionRoom};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
}

/// State shared by all connection tasks.
struct Shared {
    registry: Arc<SessionRegistry>,
    stats: RwLock<RelayStats>,
    next_connection: AtomicU64,
}

impl Shared {
    fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config)),
            stats: RwLock::new(RelayStats::default()),
            next_connection: AtomicU64::new(1),
        }
    }

    fn config(&self) -> &RelayConfig {
        self.registry.config()
    }
}

/// The relay server.
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Create a relay with no sessions registered yet.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    /// Relay with [`RelayConfig::default`] settings.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Sessions served by this relay.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    /// Address [`run`](Self::run) binds to.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config().bind_addr
    }

    /// Snapshot of the connection and traffic counters.
    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let addr = self.shared.config().bind_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            let connection = shared.next_connection.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, connection, shared).await {
                    log::warn!("Connection {connection} from {addr} ended: {e}");
                }
            });
        }
    }
}

/// Outcome of a successful handshake check.
struct Admission {
    seat: Seat,
    user: UserId,
}

fn reject(status: StatusCode, reason: impl Into<String>) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.into()));
    *response.status_mut() = status;
    response
}

/// Decide whether a handshake may join a session.
fn admit(shared: &Shared, request: &Request) -> Result<Admission, ErrorResponse> {
    let path = request.uri().path();
    let session_id = path
        .strip_prefix(JOIN_PATH_PREFIX)
        .filter(|segment| !segment.is_empty() && !segment.contains('/'))
        .and_then(decode_session_segment)
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, format!("no such endpoint: {path}")))?;
    let session_id = SessionId::from(session_id);

    let room = shared.registry.get(&session_id).ok_or_else(|| {
        reject(
            StatusCode::NOT_FOUND,
            format!("session {session_id} not found"),
        )
    })?;

    let user = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(UserId::from)
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "missing user id"))?;

    if !room.admits(&user) {
        return Err(reject(
            StatusCode::FORBIDDEN,
            format!("{user} is not a member of session {session_id}"),
        ));
    }

    let seat = room
        .try_take_seat(shared.config().max_members_per_session)
        .ok_or_else(|| reject(StatusCode::SERVICE_UNAVAILABLE, "session is full"))?;

    Ok(Admission { seat, user })
}

/// Stamp the authenticated sender onto an inbound event.
fn normalize(event: Event, room: &SessionRoom, user: &UserId) -> Event {
    match event {
        Event::Chat(mut chat) => {
            chat.author_id = user.clone();
            if let Some(name) = room.display_name(user) {
                chat.author.name = name.to_string();
            } else if chat.author.name.is_empty() {
                chat.author.name = user.to_string();
            }
            chat.id.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
            chat.timestamp = Some(chrono::Utc::now().to_rfc3339());
            Event::Chat(chat)
        }
        Event::Command(mut cmd) => {
            cmd.user_id = Some(user.clone());
            Event::Command(cmd)
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connection: ConnectionId,
    shared: Arc<Shared>,
) -> Result<(), RelayError> {
    let mut admission = None;
    let mut refused = false;
    let handshake = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| match admit(&shared, request) {
            Ok(admitted) => {
                admission = Some(admitted);
                Ok(response)
            }
            Err(rejection) => {
                log::info!(
                    "Rejected {} from {addr}: {}",
                    request.uri().path(),
                    rejection.status()
                );
                refused = true;
                Err(rejection)
            }
        },
    )
    .await;

    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(_) if refused => {
            shared.stats.write().await.rejected_handshakes += 1;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let Some(Admission { seat, user }) = admission else {
        return Ok(());
    };
    let room = seat.room().clone();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("{user} joined session {} from {addr}", room.id());

    let mut broadcast_rx = room.broadcast().add_member(connection, user.clone()).await;
    let mut closed_rx = room.closed_changes();

    let result = async {
        if room.is_closed() {
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }

        // Late joiners first get the current state
        for event in room.backfill(Instant::now()).await {
            ws_sender.send(Message::Text(event.encode()?.into())).await?;
        }

        loop {
            tokio::select! {
                _ = closed_rx.changed() => {
                    log::info!("Session {} closed, disconnecting {user}", room.id());
                    ws_sender.send(Message::Close(None)).await?;
                    break;
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match Event::decode(text.as_str()) {
                                Ok(event) => {
                                    let event = normalize(event, &room, &user);
                                    log::debug!("{} from {user} in session {}", event.type_tag(), room.id());
                                    room.record(&event, Instant::now()).await;
                                    room.broadcast().broadcast(Some(connection), &event)?;
                                }
                                Err(e) => {
                                    shared.stats.write().await.malformed_messages += 1;
                                    log::warn!("Dropping frame from {user}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("Dropping {}-byte binary frame from {user}", data.len());
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {user}: {e}");
                            break;
                        }
                    }
                }

                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if !shared.config().echo_to_sender && frame.origin == Some(connection) {
                                continue;
                            }
                            ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("{user} lagged by {n} frames in session {}", room.id());
                            room.broadcast().record_dropped(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok::<(), RelayError>(())
    }
    .await;

    room.broadcast().remove_member(connection).await;
    drop(seat);
    shared.stats.write().await.active_connections -= 1;
    log::info!("{user} left session {}", room.id());

    result
}
