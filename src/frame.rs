//! Framed message channel over a continuous byte stream.
//!
//! The two directions deliberately use different delimiters:
//!
//! ```text
//! host → backend   one encoded message per newline-terminated line
//! backend → host   encoded message, then a single 0x00 sentinel byte
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  {"cmd":...}\n               │   │  {"id":...}\0                │
//! │  {"cmd":...}\n               │   │  {"cmd":...,"status":...}\0  │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! The host's parser splits child output on NUL bytes while feeding the
//! child line-oriented input; both conventions are part of the host
//! contract and must not be unified. The sentinel is safe because JSON
//! string escaping keeps a raw NUL out of any encoded message - [`FrameWriter`]
//! still rejects a payload containing one instead of corrupting the stream.

use std::io::{self, BufRead, Write};

/// Reserved delimiter byte terminating each outbound frame.
pub const FRAME_SENTINEL: u8 = 0x00;

/// Errors from the framed channel.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("payload contains the frame sentinel byte")]
    SentinelInPayload,
}

/// Sentinel-delimited frame writer.
///
/// Each payload is followed by [`FRAME_SENTINEL`] and flushed immediately so
/// the host observes the message without buffering latency.
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one complete frame.
    pub fn write(&mut self, payload: &str) -> Result<(), FrameError> {
        if payload.as_bytes().contains(&FRAME_SENTINEL) {
            return Err(FrameError::SentinelInPayload);
        }
        self.writer.write_all(payload.as_bytes())?;
        self.writer.write_all(&[FRAME_SENTINEL])?;
        self.writer.flush()?;
        Ok(())
    }

    /// Get mutable access to the underlying writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

/// Line-delimited frame reader.
///
/// Treats each incoming newline-terminated line as one complete encoded
/// message, independent of the sentinel framing used for writes.
#[derive(Debug)]
pub struct FrameReader<R: BufRead> {
    reader: R,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on clean end-of-stream. The trailing line
    /// terminator (`\n` or `\r\n`) is stripped.
    pub fn read(&mut self) -> Result<Option<String>, FrameError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }

    /// Get mutable access to the underlying reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}
