//! Block payload encoding.
//!
//! Binary blobs are a sequence of frames `[kind: u32 LE][len: u32 LE][bytes][pad to 8]`.
//! The first block of a blob starts with a magic frame and a header frame; every later
//! block starts with a checkpoint-info frame. Json blobs carry the same records as one
//! line each.

use crate::source::batch::MessageBatch;
use crate::storage::block::BlockId;
use crate::writer::blob_path::FileFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAGIC: &[u8; 8] = b"TRIBLOG1";
pub const MAX_HEADER_BYTES: usize = 4096;

const FRAME_PREFIX: usize = 8;
const ALIGNMENT: usize = 8;

/// Upper bound of the bytes a block prefix adds on top of its events.
pub const MAX_PREFIX_BYTES: usize = 2 * FRAME_PREFIX + MAGIC.len() + MAX_HEADER_BYTES;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("header is {size} bytes, limit is {}", MAX_HEADER_BYTES)]
    HeaderTooLarge { size: usize },

    #[error("frame payload of {0} bytes does not fit a u32 length")]
    FrameTooLarge(usize),

    #[error("truncated frame at byte {offset}")]
    Truncated { offset: usize },

    #[error("unknown frame kind {kind} at byte {offset}")]
    UnknownKind { kind: u32, offset: usize },

    #[error("bad magic frame")]
    BadMagic,

    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    Magic = 1,
    Header = 2,
    CheckpointInfo = 3,
    Event = 4,
}

impl FrameKind {
    fn from_u32(kind: u32) -> Option<Self> {
        match kind {
            1 => Some(FrameKind::Magic),
            2 => Some(FrameKind::Header),
            3 => Some(FrameKind::CheckpointInfo),
            4 => Some(FrameKind::Event),
            _ => None,
        }
    }
}

/// Written once at the start of every blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogHeader {
    pub file_type: String,
    pub reward_function: String,
    pub default_reward: f64,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Default for LogHeader {
    fn default() -> Self {
        Self {
            file_type: "events".to_string(),
            reward_function: "earliest".to_string(),
            default_reward: 0.0,
            properties: BTreeMap::new(),
        }
    }
}

/// Compact record opening every block after the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub block: BlockId,
    pub first_offset: Option<String>,
    pub first_enqueued_time_utc: Option<DateTime<Utc>>,
    pub event_count: u32,
}

impl CheckpointInfo {
    pub fn for_group(block: BlockId, items: &[MessageBatch]) -> Self {
        let first = items.first();
        Self {
            block,
            first_offset: first.map(|item| item.offset.clone()),
            first_enqueued_time_utc: first.map(|item| item.enqueued_time_utc),
            event_count: u32::try_from(items.len()).unwrap_or(u32::MAX),
        }
    }
}

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Magic,
    Header(LogHeader),
    CheckpointInfo(CheckpointInfo),
    Event(Vec<u8>),
}

/// Bytes one event occupies in a block of the given format.
pub fn encoded_event_len(format: FileFormat, payload: &[u8]) -> usize {
    match format {
        FileFormat::Binary => framed_len(payload.len()),
        FileFormat::Json => payload.len() + 1,
    }
}

fn framed_len(len: usize) -> usize {
    FRAME_PREFIX + len.div_ceil(ALIGNMENT) * ALIGNMENT
}

fn push_frame(out: &mut Vec<u8>, kind: FrameKind, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(bytes.len()).map_err(|_| CodecError::FrameTooLarge(bytes.len()))?;
    out.extend_from_slice(&(kind as u32).to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    let padded = framed_len(bytes.len()) - FRAME_PREFIX;
    out.resize(out.len() + (padded - bytes.len()), 0);
    Ok(())
}

/// Encode the block prefix: file header when `header` is given, checkpoint info otherwise.
pub fn encode_prefix(
    format: FileFormat,
    header: Option<&LogHeader>,
    info: &CheckpointInfo,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    match (format, header) {
        (FileFormat::Binary, Some(header)) => {
            let json = serde_json::to_vec(header)?;
            check_header_size(json.len())?;
            push_frame(&mut out, FrameKind::Magic, MAGIC)?;
            push_frame(&mut out, FrameKind::Header, &json)?;
        }
        (FileFormat::Binary, None) => {
            push_frame(&mut out, FrameKind::CheckpointInfo, &serde_json::to_vec(info)?)?;
        }
        (FileFormat::Json, Some(header)) => {
            let json = serde_json::to_vec(&serde_json::json!({ "_header": header }))?;
            check_header_size(json.len())?;
            out.extend_from_slice(&json);
            out.push(b'\n');
        }
        (FileFormat::Json, None) => {
            out.extend_from_slice(&serde_json::to_vec(&serde_json::json!({ "_checkpoint": info }))?);
            out.push(b'\n');
        }
    }
    Ok(out)
}

fn check_header_size(size: usize) -> Result<(), CodecError> {
    if size > MAX_HEADER_BYTES {
        return Err(CodecError::HeaderTooLarge { size });
    }
    Ok(())
}

/// Append the events of a group.
pub fn encode_events(
    format: FileFormat,
    items: &[MessageBatch],
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    for item in items {
        match format {
            FileFormat::Binary => push_frame(out, FrameKind::Event, &item.payload)?,
            FileFormat::Json => {
                out.extend(
                    item.payload
                        .iter()
                        .map(|&b| if b == b'\n' { b' ' } else { b }),
                );
                out.push(b'\n');
            }
        }
    }
    Ok(())
}

/// Parse a binary blob (or block) back into frames.
pub fn decode_binary(bytes: &[u8]) -> Result<Vec<Frame>, CodecError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let prefix = bytes
            .get(offset..offset + FRAME_PREFIX)
            .ok_or(CodecError::Truncated { offset })?;
        let kind = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        let body_start = offset + FRAME_PREFIX;
        let body = bytes
            .get(body_start..body_start + len)
            .ok_or(CodecError::Truncated { offset })?;

        let frame = match FrameKind::from_u32(kind) {
            Some(FrameKind::Magic) if body == MAGIC => Frame::Magic,
            Some(FrameKind::Magic) => return Err(CodecError::BadMagic),
            Some(FrameKind::Header) => Frame::Header(serde_json::from_slice(body)?),
            Some(FrameKind::CheckpointInfo) => Frame::CheckpointInfo(serde_json::from_slice(body)?),
            Some(FrameKind::Event) => Frame::Event(body.to_vec()),
            None => return Err(CodecError::UnknownKind { kind, offset }),
        };
        frames.push(frame);

        // trailing padding may be absent only at the very end
        offset = (offset + framed_len(len)).min(bytes.len());
    }

    Ok(frames)
}
