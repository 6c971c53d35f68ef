//! Message sink for the terminal client
//!
//! Images are written under the download directory and referenced by
//! `file://` locator. Messages themselves are only numbered; the terminal
//! client keeps no history.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use jetlink_net::protocol::now_millis;
use jetlink_net::{InboundMessage, MessageSink, SinkError};
use tracing::debug;

pub struct DownloadSink {
    dir: PathBuf,
    next_id: AtomicI64,
}

impl DownloadSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_id: AtomicI64::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn unused_path(&self) -> PathBuf {
        let stamp = now_millis();
        let mut path = self.dir.join(format!("IMG_{stamp}.jpg"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("IMG_{stamp}_{n}.jpg"));
            n += 1;
        }
        path
    }
}

impl MessageSink for DownloadSink {
    fn save_image(&self, bytes: &[u8]) -> Result<String, SinkError> {
        let path = self.unused_path();
        std::fs::write(&path, bytes).map_err(|e| format!("{}: {}", path.display(), e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "Saved received image");
        Ok(format!("file://{}", path.display()))
    }

    fn insert(&self, message: InboundMessage) -> Result<i64, SinkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, from = %message.sender_id, "Recorded message");
        Ok(id)
    }
}
