//! Receive path towards the host application
//!
//! The transport never persists anything. An [`Inbox`] takes envelopes off
//! a link's message stream and hands them to collaborators supplied by the
//! host: a [`MessageSink`] for durable storage and a [`ForegroundPolicy`]
//! deciding whether a notification should be surfaced.
//!
//! Sink calls may block; [`Inbox::run`] makes them on the blocking pool.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::content::materialize_incoming;
use crate::error::{Error, Result};
use crate::protocol::{is_self_origin, ContentType, Envelope, EnvelopeKind};

/// Preview text used for image notifications
pub const IMAGE_PREVIEW: &str = "[image]";

/// A received message, ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender_id: String,
    /// Text, or the local locator of a stored image
    pub content: String,
    pub content_type: ContentType,
    pub reply_id: Option<i64>,
    pub timestamp: i64,
}

/// Failure reported by a [`MessageSink`]
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Durable storage supplied by the host
pub trait MessageSink: Send + Sync {
    /// Store image bytes and return a stable local locator for them
    fn save_image(&self, bytes: &[u8]) -> std::result::Result<String, SinkError>;

    /// Store a message and return its identifier
    fn insert(&self, message: InboundMessage) -> std::result::Result<i64, SinkError>;
}

/// Host-side notification predicate
pub trait ForegroundPolicy: Send + Sync {
    fn should_notify(&self, sender_id: &str) -> bool;
}

/// Never notify
pub struct Silent;

impl ForegroundPolicy for Silent {
    fn should_notify(&self, _sender_id: &str) -> bool {
        false
    }
}

/// Outcome of accepting one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stored_id: i64,
    pub sender_id: String,
    pub preview: String,
    /// Whether the host asked for a notification
    pub notify: bool,
}

struct Parts<S, P> {
    own_id: String,
    sink: S,
    policy: P,
}

/// Cheap to clone; clones share the sink and policy
pub struct Inbox<S, P> {
    parts: Arc<Parts<S, P>>,
}

impl<S, P> Clone for Inbox<S, P> {
    fn clone(&self) -> Self {
        Self {
            parts: self.parts.clone(),
        }
    }
}

impl<S, P> Inbox<S, P>
where
    S: MessageSink + 'static,
    P: ForegroundPolicy + 'static,
{
    pub fn new(own_id: impl Into<String>, sink: S, policy: P) -> Self {
        Self {
            parts: Arc::new(Parts {
                own_id: own_id.into(),
                sink,
                policy,
            }),
        }
    }

    pub fn sink(&self) -> &S {
        &self.parts.sink
    }

    /// Store one envelope
    ///
    /// Returns `Ok(None)` for envelopes that are not stored: our own
    /// echoed frames and anything that is not a `MSG`.
    pub fn accept(&self, envelope: Envelope) -> Result<Option<Delivery>> {
        let parts = &*self.parts;
        if is_self_origin(&envelope, &parts.own_id) {
            debug!(from = %envelope.from, "Skipping self-origin envelope");
            return Ok(None);
        }
        if envelope.kind != EnvelopeKind::Message {
            debug!(kind = envelope.kind.as_str(), "Ignoring non-message envelope");
            return Ok(None);
        }
        let Some(payload) = envelope.payload else {
            return Ok(None);
        };
        debug!(
            from = %envelope.from,
            content_type = payload.content_type.as_str(),
            "Storing message"
        );

        let (content, preview) = match payload.content_type {
            ContentType::Text => (payload.content.clone(), payload.content),
            ContentType::Image => {
                let bytes = materialize_incoming(&payload.content)?;
                let locator = parts.sink.save_image(&bytes).map_err(Error::Sink)?;
                (locator, IMAGE_PREVIEW.to_string())
            }
        };

        let stored_id = parts
            .sink
            .insert(InboundMessage {
                sender_id: envelope.from.clone(),
                content,
                content_type: payload.content_type,
                reply_id: payload.reply_id,
                timestamp: envelope.timestamp,
            })
            .map_err(Error::Sink)?;

        Ok(Some(Delivery {
            stored_id,
            notify: parts.policy.should_notify(&envelope.from),
            sender_id: envelope.from,
            preview,
        }))
    }

    /// Drain a message stream until it closes, calling `on_delivery` for
    /// every stored message
    ///
    /// Envelopes are accepted one at a time, in stream order, each on the
    /// blocking pool.
    pub async fn run<F>(&self, mut messages: broadcast::Receiver<Envelope>, mut on_delivery: F)
    where
        F: FnMut(Delivery),
    {
        loop {
            match messages.recv().await {
                Ok(envelope) => {
                    let inbox = self.clone();
                    match tokio::task::spawn_blocking(move || inbox.accept(envelope)).await {
                        Ok(Ok(Some(delivery))) => on_delivery(delivery),
                        Ok(Ok(None)) => {}
                        Ok(Err(e)) => warn!(error = %e, "Failed to store incoming message"),
                        Err(e) => warn!(error = %e, "Sink task failed"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Inbox lagged behind, messages lost");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Message stream closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        images: Mutex<Vec<Vec<u8>>>,
        messages: Mutex<Vec<InboundMessage>>,
    }

    impl MessageSink for MemorySink {
        fn save_image(&self, bytes: &[u8]) -> std::result::Result<String, SinkError> {
            let mut images = self.images.lock().unwrap();
            images.push(bytes.to_vec());
            Ok(format!("mem://image/{}", images.len()))
        }

        fn insert(&self, message: InboundMessage) -> std::result::Result<i64, SinkError> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(message);
            Ok(messages.len() as i64)
        }
    }

    struct Full;

    impl MessageSink for Full {
        fn save_image(&self, _bytes: &[u8]) -> std::result::Result<String, SinkError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume").into())
        }

        fn insert(&self, _message: InboundMessage) -> std::result::Result<i64, SinkError> {
            Err("database locked".into())
        }
    }

    struct Always;

    impl ForegroundPolicy for Always {
        fn should_notify(&self, _sender_id: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_text_message_stored() {
        let inbox = Inbox::new("u2", MemorySink::default(), Always);
        let env = Envelope::message("u1", Some("u2"), Payload::text("hi").with_reply(Some(3)));

        let delivery = inbox.accept(env.clone()).unwrap().unwrap();
        assert_eq!(delivery.stored_id, 1);
        assert_eq!(delivery.sender_id, "u1");
        assert_eq!(delivery.preview, "hi");
        assert!(delivery.notify);

        let stored = inbox.sink().messages.lock().unwrap()[0].clone();
        assert_eq!(stored.content, "hi");
        assert_eq!(stored.reply_id, Some(3));
        assert_eq!(stored.timestamp, env.timestamp);
    }

    #[test]
    fn test_self_origin_skipped() {
        let inbox = Inbox::new("u1", MemorySink::default(), Silent);
        let env = Envelope::message("u1", Some("u2"), Payload::text("mine"));
        assert_eq!(inbox.accept(env).unwrap(), None);
        assert!(inbox.sink().messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_non_message_ignored() {
        let inbox = Inbox::new("u2", MemorySink::default(), Silent);
        assert_eq!(inbox.accept(Envelope::heartbeat("u1")).unwrap(), None);
        assert_eq!(inbox.accept(Envelope::typing("u1", None)).unwrap(), None);
    }

    #[test]
    fn test_image_materialized_to_locator() {
        let inbox = Inbox::new("u2", MemorySink::default(), Silent);
        let env = Envelope::message("u1", None, Payload::image(STANDARD.encode([1u8, 2, 3])));

        let delivery = inbox.accept(env).unwrap().unwrap();
        assert_eq!(delivery.preview, IMAGE_PREVIEW);
        assert!(!delivery.notify);

        assert_eq!(inbox.sink().images.lock().unwrap()[0], vec![1, 2, 3]);
        let stored = inbox.sink().messages.lock().unwrap()[0].clone();
        assert_eq!(stored.content, "mem://image/1");
        assert_eq!(stored.content_type, ContentType::Image);
    }

    #[test]
    fn test_bad_image_not_stored() {
        let inbox = Inbox::new("u2", MemorySink::default(), Silent);
        let env = Envelope::message("u1", None, Payload::image("%%%"));
        assert!(matches!(inbox.accept(env), Err(Error::Content(_))));
        assert!(inbox.sink().messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sink_failure_keeps_source() {
        use std::error::Error as _;

        let inbox = Inbox::new("u2", Full, Silent);
        let text = Envelope::message("u1", None, Payload::text("hi"));
        let err = inbox.accept(text).unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(err.source().unwrap().to_string(), "database locked");

        let image = Envelope::message("u1", None, Payload::image(STANDARD.encode([9u8])));
        let err = inbox.accept(image).unwrap_err();
        let io = err
            .source()
            .and_then(|e| e.downcast_ref::<std::io::Error>())
            .unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[derive(Default)]
    struct ThreadRecorder {
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl MessageSink for ThreadRecorder {
        fn save_image(&self, _bytes: &[u8]) -> std::result::Result<String, SinkError> {
            Ok("mem://image".into())
        }

        fn insert(&self, _message: InboundMessage) -> std::result::Result<i64, SinkError> {
            let mut threads = self.threads.lock().unwrap();
            threads.push(std::thread::current().id());
            Ok(threads.len() as i64)
        }
    }

    #[tokio::test]
    async fn test_run_stores_off_the_runtime_thread() {
        // The test runtime is single-threaded, so its worker is this thread
        let runtime_thread = std::thread::current().id();
        let inbox = Inbox::new("u2", ThreadRecorder::default(), Silent);
        let (tx, rx) = broadcast::channel(4);
        tx.send(Envelope::message("u1", None, Payload::text("a"))).unwrap();
        drop(tx);

        let mut delivered = 0;
        inbox.run(rx, |_| delivered += 1).await;
        assert_eq!(delivered, 1);

        let threads = inbox.sink().threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], runtime_thread);
    }

    #[tokio::test]
    async fn test_run_until_closed() {
        let inbox = Inbox::new("u2", MemorySink::default(), Silent);
        let (tx, rx) = broadcast::channel(8);
        tx.send(Envelope::message("u1", None, Payload::text("a"))).unwrap();
        tx.send(Envelope::message("u2", None, Payload::text("echo"))).unwrap();
        tx.send(Envelope::message("u3", None, Payload::text("b"))).unwrap();
        drop(tx);

        let mut seen = Vec::new();
        inbox.run(rx, |d| seen.push(d.sender_id)).await;
        assert_eq!(seen, vec!["u1", "u3"]);
    }
}
