//! Server side of one accepted socket
//!
//! Reads lines, validates each as an envelope and hands the original line
//! bytes to the registry for relay. Malformed lines are dropped; the
//! connection stays open.
//!
//! When the peer stops sending, the session leaves the registry and keeps
//! writing until its queue is empty, so a half-closed peer still gets the
//! echo of its last line.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::frame::{preview, read_frame, write_frame};
use crate::hub::{ConnId, Line, Registry};
use crate::protocol::Envelope;

/// Why a session ended
#[derive(Debug)]
enum Exit {
    Eof,
    ReadFailed(Error),
    WriteFailed(Error),
    /// The hub dropped our queue (shutdown)
    QueueClosed,
}

pub(crate) struct Session {
    id: ConnId,
    addr: SocketAddr,
    registry: Arc<Registry>,
    max_line_bytes: usize,
}

impl Session {
    pub(crate) fn new(addr: SocketAddr, registry: Arc<Registry>, max_line_bytes: usize) -> Self {
        Self {
            id: ConnId::new(),
            addr,
            registry,
            max_line_bytes,
        }
    }

    pub(crate) async fn run(self, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        if !self.registry.join(self.id, tx) {
            debug!(addr = %self.addr, "Hub closing, refusing connection");
            return;
        }
        info!(conn = %self.id, addr = %self.addr, "Peer joined");

        // Learned from the first valid envelope
        let mut peer_id: Option<String> = None;

        let writing = write_loop(writer, rx);
        tokio::pin!(writing);

        let exit = tokio::select! {
            exit = self.read_loop(reader, &mut peer_id) => {
                // Dropping our queue sender lets the writer finish once it
                // has flushed what is already queued
                self.registry.leave(self.id);
                match (&mut writing).await {
                    Exit::WriteFailed(e) => Exit::WriteFailed(e),
                    _ => exit,
                }
            }
            exit = &mut writing => exit,
        };

        // Both socket halves are closed by now
        self.registry.leave(self.id);
        let peer = peer_id.as_deref().unwrap_or("-");
        match exit {
            Exit::Eof => info!(conn = %self.id, peer, "Peer disconnected"),
            Exit::QueueClosed => debug!(conn = %self.id, peer, "Session closed by hub"),
            Exit::ReadFailed(e) => warn!(conn = %self.id, peer, error = %e, "Read error"),
            Exit::WriteFailed(e) => warn!(conn = %self.id, peer, error = %e, "Write error"),
        }
    }

    async fn read_loop(&self, reader: OwnedReadHalf, peer_id: &mut Option<String>) -> Exit {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame(&mut reader, self.max_line_bytes).await {
                Ok(line) => self.relay(line, peer_id),
                Err(Error::ConnectionClosed) => return Exit::Eof,
                Err(e) if e.is_protocol() => {
                    warn!(conn = %self.id, error = %e, "Dropping unreadable line");
                }
                Err(e) => return Exit::ReadFailed(e),
            }
        }
    }

    fn relay(&self, line: String, peer_id: &mut Option<String>) {
        match Envelope::decode(&line) {
            Ok(envelope) => {
                if peer_id.is_none() {
                    debug!(conn = %self.id, from = %envelope.from, "Peer identified");
                    *peer_id = Some(envelope.from.clone());
                }
                // Relay the bytes we received, not a re-encoding
                let line: Line = Arc::from(line);
                let delivered = self.registry.broadcast(&line, None);
                debug!(
                    conn = %self.id,
                    kind = envelope.kind.as_str(),
                    from = %envelope.from,
                    delivered,
                    "Relayed envelope"
                );
            }
            Err(e) => {
                warn!(
                    conn = %self.id,
                    error = %e,
                    line = %preview(&line),
                    "Dropping malformed envelope"
                );
            }
        }
    }
}

/// Drain the outbound queue onto the socket
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Line>) -> Exit {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &line).await {
            return Exit::WriteFailed(e);
        }
    }
    Exit::QueueClosed
}
