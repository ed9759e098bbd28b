//! Media chunk model and relay frame encoding
//!
//! A [`MediaChunk`] is one time-sliced segment of encoded audio or video as
//! produced by the capture stage. On the relay wire each chunk travels as one
//! binary frame: a fixed 17-byte big-endian header followed by the opaque
//! payload.
//!
//! ```text
//! +-----------+------------------+------------------+-----------------+
//! | kind (u8) | sequence (u64)   | captured_at (u64)| payload ...     |
//! +-----------+------------------+------------------+-----------------+
//! ```

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Length of the binary frame header in bytes
pub const FRAME_HEADER_LEN: usize = 17;

/// Kind of media carried by a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    fn as_byte(self) -> u8 {
        match self {
            MediaType::Audio => 0,
            MediaType::Video => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0 => Ok(MediaType::Audio),
            1 => Ok(MediaType::Video),
            other => Err(FrameError::UnknownMediaType(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped, independently encoded segment of captured media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChunk {
    /// Strictly increasing per media type, starting at 0
    pub sequence_number: u64,

    /// Audio or video
    pub media_type: MediaType,

    /// Encoded bytes, opaque to everything but the transcoder
    pub payload: Bytes,

    /// Wall-clock time (unix ms) at which this segment started
    pub captured_at_ms: u64,
}

impl MediaChunk {
    pub fn new(
        sequence_number: u64,
        media_type: MediaType,
        payload: impl Into<Bytes>,
        captured_at_ms: u64,
    ) -> Self {
        Self {
            sequence_number,
            media_type,
            payload: payload.into(),
            captured_at_ms,
        }
    }

    /// Encode this chunk as a relay binary frame
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.media_type.as_byte());
        buf.put_u64(self.sequence_number);
        buf.put_u64(self.captured_at_ms);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode a relay binary frame
    pub fn decode_frame(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated(frame.len()));
        }

        let mut header = &frame[..FRAME_HEADER_LEN];
        let media_type = MediaType::from_byte(header.get_u8())?;
        let sequence_number = header.get_u64();
        let captured_at_ms = header.get_u64();

        Ok(Self {
            sequence_number,
            media_type,
            payload: Bytes::copy_from_slice(&frame[FRAME_HEADER_LEN..]),
            captured_at_ms,
        })
    }
}

/// Relay frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes is shorter than the {FRAME_HEADER_LEN}-byte header")]
    Truncated(usize),

    #[error("unknown media type tag {0}")]
    UnknownMediaType(u8),
}

/// Tracks the last sequence number seen per media type
///
/// Used wherever chunks cross a boundary that must preserve production
/// order. A chunk whose sequence number does not strictly increase over the
/// previous one of the same media type is reported as a [`SequenceViolation`].
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<MediaType, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk, rejecting it if it arrives out of order
    pub fn observe(&mut self, chunk: &MediaChunk) -> Result<(), SequenceViolation> {
        if let Some(&last) = self.last.get(&chunk.media_type) {
            if chunk.sequence_number <= last {
                return Err(SequenceViolation {
                    media_type: chunk.media_type,
                    previous: last,
                    received: chunk.sequence_number,
                });
            }
        }
        self.last.insert(chunk.media_type, chunk.sequence_number);
        Ok(())
    }

    pub fn last(&self, media_type: MediaType) -> Option<u64> {
        self.last.get(&media_type).copied()
    }
}

/// A chunk arrived with a sequence number at or below its predecessor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{media_type} chunk {received} arrived after chunk {previous}")]
pub struct SequenceViolation {
    pub media_type: MediaType,
    pub previous: u64,
    pub received: u64,
}

/// Current wall-clock time in unix milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
