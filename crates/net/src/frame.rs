//! Newline-delimited frame encoding/decoding
//!
//! Wire format: one UTF-8 JSON object per line, terminated by `\n`.
//! A trailing `\r` is tolerated on read. Lines longer than the configured
//! maximum are skipped up to their terminator and reported as protocol
//! errors so the stream stays usable.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Default maximum line size (8MB). A 1024px JPEG in Base64 sits well below this.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Read one line from a buffered stream, without its terminator
///
/// Returns `Error::ConnectionClosed` on a clean EOF. A final unterminated
/// line before EOF is returned as a regular line.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R, max_len: usize) -> Result<String> {
    let mut buf = Vec::new();
    let limit = max_len as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;

    if n == 0 {
        return Err(Error::ConnectionClosed);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max_len {
        discard_line(reader).await?;
        return Err(Error::Protocol(format!(
            "Line too large: more than {} bytes",
            max_len
        )));
    }

    String::from_utf8(buf).map_err(|_| Error::Protocol("Invalid UTF-8 in line".into()))
}

/// Skip the remainder of the current line
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Write one line followed by the terminator and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    if line.contains('\n') {
        return Err(Error::Protocol("Line contains an embedded newline".into()));
    }

    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    // Flush to ensure delivery
    writer.flush().await?;

    Ok(())
}

/// Shorten a line for logging
pub(crate) fn preview(line: &str) -> String {
    const MAX_PREVIEW: usize = 200;
    match line.char_indices().nth(MAX_PREVIEW) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
