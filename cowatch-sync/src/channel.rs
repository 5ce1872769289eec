//! WebSocket session channel.
//!
//! Provides:
//! - One bidirectional connection per client, scoped to a session
//! - Fire-and-forget send of typed events
//! - Ordered, one-at-a-time delivery of inbound frames
//! - Lifecycle `Connecting → Open → Closed`, with no internal reconnect
//!
//! The channel splits into a send-only [`ChannelSender`] and a receive-only
//! [`ChannelReceiver`] so that each component holds only the capability it
//! needs.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{ClientConfig, USER_ID_HEADER};
use crate::error::SyncError;
use crate::protocol::{Event, SessionId, UserId};

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Credentials and display identity of the local user.
#[derive(Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    /// Bearer credential, passed through verbatim.
    pub credential: String,
}

impl Identity {
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Anything events can be sent through.
pub trait EventSink {
    fn send(&self, event: &Event) -> Result<(), SyncError>;
}

impl<T: EventSink + ?Sized> EventSink for &T {
    fn send(&self, event: &Event) -> Result<(), SyncError> {
        (**self).send(event)
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn send(&self, event: &Event) -> Result<(), SyncError> {
        (**self).send(event)
    }
}

enum Outgoing {
    Frame(String),
    Close,
}

/// Send half of a session channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSender {
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    state: Arc<watch::Sender<ChannelState>>,
}

impl ChannelSender {
    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions, e.g. to notice a dropped connection.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Release the connection. Later sends fail with [`SyncError::ChannelClosed`].
    pub fn close(&self) {
        let previous = self.state.send_replace(ChannelState::Closed);
        if previous != ChannelState::Closed {
            let _ = self.outgoing_tx.send(Outgoing::Close);
        }
    }
}

impl EventSink for ChannelSender {
    /// Serialize and transmit. Returns once the frame is queued for the socket.
    fn send(&self, event: &Event) -> Result<(), SyncError> {
        if self.state() != ChannelState::Open {
            return Err(SyncError::ChannelClosed);
        }
        let frame = event.encode()?;
        log::trace!("queue {} frame ({} bytes)", event.type_tag(), frame.len());
        self.outgoing_tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// Receive half of a session channel.
pub struct ChannelReceiver {
    inbound_rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelReceiver {
    /// Next inbound frame in arrival order, or `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound_rx.recv().await
    }

    /// Invoke `handler` once per inbound frame until the channel closes.
    ///
    /// The handler is never invoked concurrently with itself.
    pub async fn on_receive<F>(mut self, mut handler: F)
    where
        F: FnMut(String),
    {
        while let Some(frame) = self.inbound_rx.recv().await {
            handler(frame);
        }
    }
}

/// A client's connection to one session.
pub struct SessionChannel {
    session_id: SessionId,
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl SessionChannel {
    /// Connect to `session_id` on the configured relay.
    ///
    /// Fails with [`SyncError::Connection`] when the relay rejects the session
    /// or cannot be reached. There is no built-in retry.
    pub async fn open(
        config: &ClientConfig,
        identity: &Identity,
        session_id: &SessionId,
    ) -> Result<Self, SyncError> {
        let state = Arc::new(watch::channel(ChannelState::Connecting).0);

        let url = config.session_url(session_id.as_str());
        let mut request = url.as_str().into_client_request()?;
        {
            let headers = request.headers_mut();
            if !identity.credential.is_empty() {
                headers.insert(
                    AUTHORIZATION,
                    header_value(&format!("Bearer {}", identity.credential))?,
                );
            }
            headers.insert(USER_ID_HEADER, header_value(identity.user_id.as_str())?);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                state.send_replace(ChannelState::Closed);
                log::warn!("Failed to open channel for session {session_id}: {e}");
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer task: forward queued frames to the socket
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outgoing::Frame(text) => {
                        if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                            log::warn!("Channel write failed: {e}");
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = ws_writer.close().await;
        });

        state.send_replace(ChannelState::Open);
        log::info!("Channel open: user {} in session {session_id}", identity.user_id);

        // Reader task: deliver inbound frames one at a time
        let reader_state = state.clone();
        let writer_tx = out_tx.clone();
        let session = session_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(data)) => {
                        log::debug!("Ignoring {}-byte binary frame", data.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Channel read failed in session {session}: {e}");
                        break;
                    }
                }
            }

            reader_state.send_replace(ChannelState::Closed);
            let _ = writer_tx.send(Outgoing::Close);
            log::info!("Channel closed for session {session}");
        });

        Ok(Self {
            session_id: session_id.clone(),
            sender: ChannelSender {
                outgoing_tx: out_tx,
                state,
            },
            receiver: ChannelReceiver { inbound_rx: in_rx },
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> ChannelState {
        self.sender.state()
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn send(&self, event: &Event) -> Result<(), SyncError> {
        self.sender.send(event)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub async fn on_receive<F>(self, handler: F)
    where
        F: FnMut(String),
    {
        self.receiver.on_receive(handler).await
    }

    pub fn close(&self) {
        self.sender.close()
    }

    /// Separate the send and receive capabilities.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SyncError> {
    HeaderValue::from_str(value)
        .map_err(|e| SyncError::Connection(format!("invalid handshake header: {e}")))
}

/// In-memory sink that records every sent event.
///
/// Stands in for a channel when the components run without a network.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    sent: Arc<Mutex<Vec<Event>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events sent so far.
    pub fn sent(&self) -> Vec<Event> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.sent().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make later sends fail as on a closed channel.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl EventSink for MemorySink {
    fn send(&self, event: &Event) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelClosed);
        }
        let mut sent = self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sent.push(event.clone());
        Ok(())
    }
}
