//! Decoder for the engine's multiplexed log stream.
//!
//! Each frame is an 8 byte header (stream tag, three reserved bytes, big
//! endian payload length) followed by the payload. With timestamps enabled
//! the payload starts with a fixed width RFC3339 timestamp and one separator
//! byte before the actual text.
//!
//! The engine cuts long lines by byte count, so a multi-byte character can
//! span two frames. Text is kept as raw bytes per chunk and decoded once.

use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use thiserror::Error;

pub const HEADER_LEN: usize = 8;
pub const TIMESTAMP_LEN: usize = 30;
const PREFIX_LEN: usize = TIMESTAMP_LEN + 1;

const STDOUT_TAG: u8 = 1;
const STDERR_TAG: u8 = 2;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("unknown stream tag {0}")]
    UnknownStream(u8),
    #[error("truncated frame: expected {expected} bytes, {remaining} left")]
    Truncated { expected: usize, remaining: usize },
    #[error("frame payload of {0} bytes cannot hold a timestamp")]
    FrameTooShort(usize),
    #[error("invalid timestamp '{raw}': {source}")]
    Timestamp {
        raw: String,
        source: chrono::ParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl TryFrom<u8> for LogStream {
    type Error = DemuxError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            STDOUT_TAG => Ok(LogStream::Stdout),
            STDERR_TAG => Ok(LogStream::Stderr),
            other => Err(DemuxError::UnknownStream(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: LogStream,
    pub timestamp: DateTime<Utc>,
    pub content: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
    /// Both streams ordered by timestamp
    pub all: Vec<LogChunk>,
    /// Cursor for the next incremental read
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl ContainerLogs {
    /// Nothing newer than the cursor
    pub fn empty(since: Option<DateTime<Utc>>) -> Self {
        Self {
            last_timestamp: since,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Combined output in timestamp order
    pub fn merged(&self) -> String {
        let bytes: Vec<u8> = self
            .all
            .iter()
            .flat_map(|chunk| chunk.content.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Split a multiplexed stream, keeping only chunks newer than `since`.
pub fn demultiplex<B: Buf>(
    mut frames: B,
    since: Option<DateTime<Utc>>,
) -> Result<ContainerLogs, DemuxError> {
    let mut logs = ContainerLogs::empty(since);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    while frames.has_remaining() {
        if frames.remaining() < HEADER_LEN {
            return Err(DemuxError::Truncated {
                expected: HEADER_LEN,
                remaining: frames.remaining(),
            });
        }
        let stream = LogStream::try_from(frames.get_u8())?;
        frames.advance(3);
        let len = frames.get_u32() as usize;

        if len < PREFIX_LEN {
            return Err(DemuxError::FrameTooShort(len));
        }
        if frames.remaining() < len {
            return Err(DemuxError::Truncated {
                expected: len,
                remaining: frames.remaining(),
            });
        }

        let mut payload = frames.copy_to_bytes(len);
        let raw = String::from_utf8_lossy(&payload[..TIMESTAMP_LEN]);
        let timestamp = DateTime::parse_from_rfc3339(&raw)
            .map_err(|source| DemuxError::Timestamp {
                raw: raw.to_string(),
                source,
            })?
            .with_timezone(&Utc);

        if since.is_some_and(|since| timestamp <= since) {
            continue;
        }

        let content = payload.split_off(PREFIX_LEN);
        match stream {
            LogStream::Stdout => stdout.extend_from_slice(&content),
            LogStream::Stderr => stderr.extend_from_slice(&content),
        }
        if logs.last_timestamp.map_or(true, |last| timestamp > last) {
            logs.last_timestamp = Some(timestamp);
        }
        logs.all.push(LogChunk {
            stream,
            timestamp,
            content,
        });
    }

    logs.all.sort_by_key(|chunk| chunk.timestamp);
    logs.stdout = String::from_utf8_lossy(&stdout).into_owned();
    logs.stderr = String::from_utf8_lossy(&stderr).into_owned();
    Ok(logs)
}

/// Encode one frame the way the engine does.
#[cfg(test)]
pub(crate) fn encode_frame(stream: LogStream, timestamp: DateTime<Utc>, content: &str) -> Vec<u8> {
    encode_raw_frame(stream, timestamp, content.as_bytes())
}

#[cfg(test)]
pub(crate) fn encode_raw_frame(stream: LogStream, timestamp: DateTime<Utc>, content: &[u8]) -> Vec<u8> {
    let stamp = timestamp.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string();
    let payload_len = stamp.len() + 1 + content.len();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
    frame.push(match stream {
        LogStream::Stdout => STDOUT_TAG,
        LogStream::Stderr => STDERR_TAG,
    });
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
    frame.extend_from_slice(stamp.as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(content);
    frame
}
