//! FLV tag reader/writer
//!
//! Each transcoded chunk comes back as a self-contained FLV segment whose
//! timestamps start near zero. [`Timeline`] moves those tags onto the
//! session timeline so that the single outbound connection sees one
//! continuous stream.

use bytes::Bytes;

/// Size of the FLV file header
pub const HEADER_LEN: usize = 9;

/// Size of a tag header
const TAG_HEADER_LEN: usize = 11;

/// FLV header advertising audio and video, followed by PreviousTagSize0
pub const STREAM_HEADER: [u8; 13] = [
    b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Audio,
    Video,
    Script,
}

impl TagKind {
    fn from_byte(byte: u8) -> Result<Self, FlvError> {
        match byte & 0x1f {
            8 => Ok(TagKind::Audio),
            9 => Ok(TagKind::Video),
            18 => Ok(TagKind::Script),
            other => Err(FlvError::UnknownTagType(other)),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            TagKind::Audio => 8,
            TagKind::Video => 9,
            TagKind::Script => 18,
        }
    }
}

/// One FLV tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub kind: TagKind,
    pub timestamp_ms: u32,
    pub data: Bytes,
}

impl FlvTag {
    pub fn new(kind: TagKind, timestamp_ms: u32, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            timestamp_ms,
            data: data.into(),
        }
    }

    /// AVC or AAC decoder configuration record
    pub fn is_sequence_header(&self) -> bool {
        match self.kind {
            TagKind::Video => {
                self.data.len() >= 2 && self.data[0] & 0x0f == 7 && self.data[1] == 0
            }
            TagKind::Audio => self.data.len() >= 2 && self.data[0] >> 4 == 10 && self.data[1] == 0,
            TagKind::Script => false,
        }
    }

    /// Append the tag and its PreviousTagSize trailer
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let size = self.data.len() as u32;
        let ts = self.timestamp_ms;

        out.push(self.kind.as_byte());
        out.extend_from_slice(&size.to_be_bytes()[1..]);
        out.extend_from_slice(&ts.to_be_bytes()[1..]);
        out.push((ts >> 24) as u8);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&(TAG_HEADER_LEN as u32 + size).to_be_bytes());
    }

    pub fn encoded_len(&self) -> usize {
        TAG_HEADER_LEN + self.data.len() + 4
    }
}

fn read_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

/// Parse a complete FLV segment into its tags
pub fn parse_segment(segment: &[u8]) -> Result<Vec<FlvTag>, FlvError> {
    if segment.len() < HEADER_LEN || &segment[..3] != b"FLV" {
        return Err(FlvError::BadHeader);
    }
    let data_offset = u32::from_be_bytes([segment[5], segment[6], segment[7], segment[8]]) as usize;

    // Skip the header and PreviousTagSize0
    let mut pos = data_offset
        .checked_add(4)
        .filter(|p| *p <= segment.len())
        .ok_or(FlvError::BadHeader)?;

    let mut tags = Vec::new();
    while pos < segment.len() {
        let remaining = &segment[pos..];
        if remaining.len() < TAG_HEADER_LEN {
            return Err(FlvError::Truncated { offset: pos });
        }

        let kind = TagKind::from_byte(remaining[0])?;
        let size = read_u24(&remaining[1..4]) as usize;
        let timestamp_ms = read_u24(&remaining[4..7]) | ((remaining[7] as u32) << 24);

        let end = TAG_HEADER_LEN + size + 4;
        if remaining.len() < end {
            return Err(FlvError::Truncated { offset: pos });
        }

        let data = Bytes::copy_from_slice(&remaining[TAG_HEADER_LEN..TAG_HEADER_LEN + size]);
        tags.push(FlvTag {
            kind,
            timestamp_ms,
            data,
        });
        pos += end;
    }

    Ok(tags)
}

/// Maps segment-relative tags onto the session timeline
///
/// A tag lands at `(captured_at - first_captured_at) + tag_timestamp`, then
/// is clamped so that audio and video timestamps never decrease. Metadata is
/// forwarded once; decoder configuration only when it changes.
#[derive(Debug, Default)]
pub struct Timeline {
    origin_ms: Option<u64>,
    last_audio: Option<u32>,
    last_video: Option<u32>,
    metadata_sent: bool,
    audio_config: Option<Bytes>,
    video_config: Option<Bytes>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite one segment's tags for the outbound stream
    pub fn place(&mut self, captured_at_ms: u64, tags: Vec<FlvTag>) -> Vec<FlvTag> {
        let origin = *self.origin_ms.get_or_insert(captured_at_ms);
        let base = captured_at_ms.saturating_sub(origin);

        let mut placed = Vec::with_capacity(tags.len());
        for mut tag in tags {
            match tag.kind {
                TagKind::Script => {
                    if self.metadata_sent {
                        continue;
                    }
                    self.metadata_sent = true;
                    tag.timestamp_ms = 0;
                    placed.push(tag);
                    continue;
                }
                TagKind::Audio | TagKind::Video if tag.is_sequence_header() => {
                    let config = match tag.kind {
                        TagKind::Audio => &mut self.audio_config,
                        _ => &mut self.video_config,
                    };
                    if config.as_ref() == Some(&tag.data) {
                        continue;
                    }
                    *config = Some(tag.data.clone());
                }
                _ => {}
            }

            let target = base.saturating_add(tag.timestamp_ms as u64).min(u32::MAX as u64) as u32;
            let last = match tag.kind {
                TagKind::Audio => &mut self.last_audio,
                _ => &mut self.last_video,
            };
            let ts = match *last {
                Some(prev) if target < prev => prev,
                _ => target,
            };
            *last = Some(ts);
            tag.timestamp_ms = ts;
            placed.push(tag);
        }
        placed
    }
}

/// FLV parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlvError {
    #[error("missing or invalid FLV header")]
    BadHeader,

    #[error("truncated FLV tag at offset {offset}")]
    Truncated { offset: usize },

    #[error("unknown FLV tag type {0}")]
    UnknownTagType(u8),
}
