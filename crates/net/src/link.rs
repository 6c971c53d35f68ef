//! Client link to a hub
//!
//! A link owns one outbound connection and supervises it forever:
//! connect, read until the socket fails, connect again. Failed attempts
//! wait a fixed retry interval. Incoming envelopes are published on two
//! broadcast streams, typing signals and everything else.
//!
//! Outgoing lines are queued to a writer loop owned by the connection, so
//! only that loop touches the socket and a stalled peer never holds up
//! [`Link::disconnect`].
//!
//! The hub echoes every frame back to its sender. The link delivers those
//! frames like any other; use [`Link::is_self_origin`] to filter them.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::frame::{preview, read_frame, write_frame};
use crate::protocol::{self, ContentType, Envelope, EnvelopeKind, Payload};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// A peer is typing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub from: String,
    pub to: Option<String>,
    pub timestamp: i64,
}

/// One line waiting for the writer loop
struct Outgoing {
    line: String,
    /// Present when the caller waits for the write
    done: Option<oneshot::Sender<Result<()>>>,
}

/// State shared between the handle and the supervisor task
struct Shared {
    own_id: String,
    state_tx: watch::Sender<LinkState>,
    /// Queue of the current connection's writer; `None` while offline
    outbound: StdMutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    messages: broadcast::Sender<Envelope>,
    typing: broadcast::Sender<TypingSignal>,
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?*current, to = ?state, "Link state changed");
                *current = state;
                true
            }
        });
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Outgoing>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a line to the writer loop without waiting for it
    fn enqueue(&self, line: String, done: Option<oneshot::Sender<Result<()>>>) -> Result<()> {
        if self.state() != LinkState::Connected {
            return Err(Error::NotConnected);
        }
        let outbound = self.outbound();
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::NotConnected);
        };
        tx.send(Outgoing { line, done })
            .map_err(|_| Error::NotConnected)
    }

    /// Queue a line and wait until it is on the socket
    async fn write_line(&self, line: String) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(line, Some(done_tx))?;
        // Dropped unanswered when the connection ends first
        done_rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Outgoing>) {
        *self.outbound() = Some(tx);
        self.set_state(LinkState::Connected);
    }

    /// Forget the writer queue and mark the link disconnected
    fn drop_connection(&self) {
        self.outbound().take();
        self.set_state(LinkState::Disconnected);
    }

    fn dispatch(&self, line: &str) {
        let envelope = match Envelope::decode(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, line = %preview(line), "Dropping malformed envelope");
                return;
            }
        };

        debug!(kind = envelope.kind.as_str(), from = %envelope.from, "Received envelope");

        match envelope.kind {
            EnvelopeKind::Typing => {
                let signal = TypingSignal {
                    from: envelope.from,
                    to: envelope.to,
                    timestamp: envelope.timestamp,
                };
                // No subscribers is fine
                let _ = self.typing.send(signal);
            }
            _ => {
                let _ = self.messages.send(envelope);
            }
        }
    }
}

fn encode_line(envelope: &Envelope) -> Result<String> {
    envelope
        .encode()
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))
}

/// Why a connected period ended
enum ConnectionEnd {
    Eof,
    ReadFailed(Error),
    WriteFailed,
    QueueClosed,
}

/// Handle to a supervised hub connection
///
/// Dropping the handle stops the supervisor as well; [`Link::disconnect`]
/// additionally waits for it to finish.
pub struct Link {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Start supervising a connection to `config.host:config.port`
    ///
    /// Returns immediately; the first connect attempt runs in the
    /// background. Must be called from within a Tokio runtime.
    pub fn connect(config: LinkConfig, own_id: impl Into<String>) -> Result<Self> {
        let own_id = own_id.into();
        if own_id.is_empty() {
            return Err(Error::EmptyIdentifier);
        }

        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (messages, _) = broadcast::channel(config.event_capacity.max(1));
        let (typing, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            own_id,
            state_tx,
            outbound: StdMutex::new(None),
            messages,
            typing,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(shared.clone(), config, shutdown_rx));

        Ok(Self {
            shared,
            shutdown_tx,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Stop reconnecting, close the socket and wait for the supervisor
    ///
    /// Sends still waiting on the socket fail with
    /// [`Error::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        let Some(handle) = self.supervisor.lock().await.take() else {
            return;
        };
        if let Err(e) = handle.await {
            warn!(error = %e, "Link supervisor ended abnormally");
        }
    }

    pub fn own_id(&self) -> &str {
        &self.shared.own_id
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Follow state transitions
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    /// Every non-typing envelope, self-origin frames included
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Envelope> {
        self.shared.messages.subscribe()
    }

    pub fn subscribe_typing(&self) -> broadcast::Receiver<TypingSignal> {
        self.shared.typing.subscribe()
    }

    /// Whether `envelope` is one of our own frames echoed by the hub
    pub fn is_self_origin(&self, envelope: &Envelope) -> bool {
        protocol::is_self_origin(envelope, &self.shared.own_id)
    }

    /// Send a `MSG` envelope
    ///
    /// Fails with [`Error::NotConnected`] unless connected; nothing is
    /// queued for later. Resolves once the line is written.
    pub async fn send(
        &self,
        to: Option<&str>,
        content_type: ContentType,
        content: impl Into<String>,
        reply_id: Option<i64>,
    ) -> Result<()> {
        let payload = Payload {
            content_type,
            content: content.into(),
            reply_id,
        };
        self.send_envelope(Envelope::message(&self.shared.own_id, to, payload))
            .await
    }

    /// Send a `HEARTBEAT` envelope
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.send_envelope(Envelope::heartbeat(&self.shared.own_id))
            .await
    }

    /// Send any envelope as-is
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let line = encode_line(&envelope)?;
        self.shared.write_line(line).await
    }

    /// Tell peers we are typing
    ///
    /// Queues the signal and returns at once. Best effort, never fails.
    pub fn notify_typing(&self, to: Option<&str>) {
        if self.state() != LinkState::Connected {
            return;
        }
        let queued = encode_line(&Envelope::typing(&self.shared.own_id, to))
            .and_then(|line| self.shared.enqueue(line, None));
        if let Err(e) = queued {
            debug!(error = %e, "Typing signal not sent");
        }
    }
}

/// Connect, read, reconnect until shutdown
async fn supervise(shared: Arc<Shared>, config: LinkConfig, mut shutdown_rx: watch::Receiver<bool>) {
    let address = config.address();
    let retry = config.retry_interval();

    loop {
        shared.set_state(LinkState::Connecting);
        debug!(addr = %address, "Connecting");

        let attempt = tokio::select! {
            attempt = TcpStream::connect(address.as_str()) => attempt,
            _ = shutdown_rx.changed() => break,
        };

        let stream = match attempt {
            Ok(stream) => stream,
            Err(e) => {
                shared.set_state(LinkState::Disconnected);
                warn!(
                    addr = %address,
                    error = %e,
                    retry_ms = config.retry_interval_ms,
                    "Connection failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = shutdown_rx.changed() => break,
                }
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        shared.attach(tx);
        info!(addr = %address, id = %shared.own_id, "Connected to hub");

        // Both socket halves live inside these futures and close with them
        let ended = tokio::select! {
            end = read_loop(&shared, reader, config.max_line_bytes) => Some(end),
            end = write_loop(writer, rx) => Some(end),
            _ = shutdown_rx.changed() => None,
        };

        shared.drop_connection();

        match ended {
            Some(ConnectionEnd::Eof) => info!(addr = %address, "Hub closed connection"),
            Some(ConnectionEnd::ReadFailed(e)) => {
                warn!(addr = %address, error = %e, "Read error")
            }
            Some(ConnectionEnd::WriteFailed) => {
                info!(addr = %address, "Connection lost while sending")
            }
            Some(ConnectionEnd::QueueClosed) => debug!(addr = %address, "Writer queue closed"),
            None => break,
        }
    }

    shared.drop_connection();
    info!(addr = %address, "Link stopped");
}

async fn read_loop(shared: &Shared, reader: OwnedReadHalf, max_line_bytes: usize) -> ConnectionEnd {
    let mut reader = BufReader::new(reader);
    loop {
        match read_frame(&mut reader, max_line_bytes).await {
            Ok(line) => shared.dispatch(&line),
            Err(Error::ConnectionClosed) => return ConnectionEnd::Eof,
            Err(e) if e.is_protocol() => {
                warn!(error = %e, "Dropping unreadable line");
            }
            Err(e) => return ConnectionEnd::ReadFailed(e),
        }
    }
}

/// Sole writer of the connection's socket, one whole line at a time
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) -> ConnectionEnd {
    while let Some(out) = rx.recv().await {
        match write_frame(&mut writer, &out.line).await {
            Ok(()) => {
                if let Some(done) = out.done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(error = %e, "Write failed, dropping connection");
                if let Some(done) = out.done {
                    let _ = done.send(Err(e));
                }
                return ConnectionEnd::WriteFailed;
            }
        }
    }
    ConnectionEnd::QueueClosed
}
