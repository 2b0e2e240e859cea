//! Frame codec for day-files.
//!
//! A day-file is a 6 byte header followed by frames:
//!
//! ```text
//! kind:u8 | len:u32 LE | payload[len] | crc32(payload):u32 LE
//! ```
//!
//! Structural frames (nodes, attributes, column creation) carry MessagePack
//! payloads. Points and packed column blocks use a fixed binary layout.

use crate::dayfile::namespace::Column;
use crate::error::{Result, StoreError};
use crate::types::{BoundedText, Timestamp, Value, ValueKind, TIMESTAMP_WIDTH};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Magic bytes for day-files.
pub const DAYFILE_MAGIC: &[u8; 4] = b"DLG\0";

/// Current day-file format version.
pub const DAYFILE_VERSION: u8 = 1;

/// Header size (magic + version + flags).
pub const HEADER_SIZE: usize = 4 + 1 + 1;

/// Frame overhead (kind + length + checksum).
const FRAME_OVERHEAD: usize = 1 + 4 + 4;

/// Upper bound on a single frame payload.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const TAG_FLOAT: u8 = 0;
const TAG_TEXT: u8 = 1;

/// Frame kind byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Node = 1,
    Attrs = 2,
    Columns = 3,
    Point = 4,
    Packed = 5,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(FrameKind::Node),
            2 => Some(FrameKind::Attrs),
            3 => Some(FrameKind::Columns),
            4 => Some(FrameKind::Point),
            5 => Some(FrameKind::Packed),
            _ => None,
        }
    }
}

/// Creation of a namespace node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeFrame {
    pub id: u32,
    pub parent: u32,
    pub name: String,
}

/// Overwrite of node attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttrsFrame {
    pub node: u32,
    pub attrs: BTreeMap<String, JsonValue>,
}

/// Creation of the column pair of a series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnsFrame {
    pub node: u32,
    pub kind: ValueKind,
}

/// A decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Node(NodeFrame),
    Attrs(AttrsFrame),
    Columns(ColumnsFrame),
    Point {
        node: u32,
        timestamp: Timestamp,
        value: Value,
    },
    Packed {
        node: u32,
        level: u32,
        timestamps: Vec<Timestamp>,
        values: Column,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Node(_) => FrameKind::Node,
            Frame::Attrs(_) => FrameKind::Attrs,
            Frame::Columns(_) => FrameKind::Columns,
            Frame::Point { .. } => FrameKind::Point,
            Frame::Packed { .. } => FrameKind::Packed,
        }
    }

    /// Encode the complete frame including kind, length and checksum.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(StoreError::Serialization(format!(
                "frame payload too large: {} bytes",
                payload.len()
            )));
        }

        let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        out.push(self.kind() as u8);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(out)
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            Frame::Node(f) => Ok(rmp_serde::to_vec(f)?),
            Frame::Attrs(f) => Ok(rmp_serde::to_vec(f)?),
            Frame::Columns(f) => Ok(rmp_serde::to_vec(f)?),
            Frame::Point {
                node,
                timestamp,
                value,
            } => {
                let mut buf = Vec::with_capacity(4 + TIMESTAMP_WIDTH + 1 + 8);
                buf.extend_from_slice(&node.to_le_bytes());
                buf.extend_from_slice(&timestamp.to_bytes());
                encode_value(&mut buf, value);
                Ok(buf)
            }
            Frame::Packed {
                node,
                level,
                timestamps,
                values,
            } => {
                if timestamps.len() != values.len() {
                    return Err(StoreError::Serialization(format!(
                        "packed columns of node {} differ in length ({} vs {})",
                        node,
                        timestamps.len(),
                        values.len()
                    )));
                }

                let mut raw_ts = Vec::with_capacity(timestamps.len() * TIMESTAMP_WIDTH);
                for ts in timestamps {
                    raw_ts.extend_from_slice(&ts.to_bytes());
                }
                let mut raw_values = Vec::new();
                match values {
                    Column::Float(col) => {
                        for v in col {
                            raw_values.extend_from_slice(&v.to_le_bytes());
                        }
                    }
                    Column::Text(col) => {
                        for t in col {
                            encode_text(&mut raw_values, t);
                        }
                    }
                }

                let ts_block = deflate(&raw_ts, *level)?;
                let value_block = deflate(&raw_values, *level)?;

                let mut buf = Vec::with_capacity(18 + ts_block.len() + value_block.len());
                buf.extend_from_slice(&node.to_le_bytes());
                buf.extend_from_slice(&(timestamps.len() as u32).to_le_bytes());
                buf.push(kind_tag(values.kind()));
                buf.push(*level as u8);
                buf.extend_from_slice(&(ts_block.len() as u32).to_le_bytes());
                buf.extend_from_slice(&ts_block);
                buf.extend_from_slice(&(value_block.len() as u32).to_le_bytes());
                buf.extend_from_slice(&value_block);
                Ok(buf)
            }
        }
    }

    fn decode_payload(kind: FrameKind, payload: &[u8]) -> Result<Self> {
        match kind {
            FrameKind::Node => Ok(Frame::Node(rmp_serde::from_slice(payload)?)),
            FrameKind::Attrs => Ok(Frame::Attrs(rmp_serde::from_slice(payload)?)),
            FrameKind::Columns => Ok(Frame::Columns(rmp_serde::from_slice(payload)?)),
            FrameKind::Point => {
                let mut cursor = Cursor::new(payload);
                let node = cursor.u32()?;
                let timestamp = Timestamp::from_bytes(cursor.take(TIMESTAMP_WIDTH)?)?;
                let value = match cursor.u8()? {
                    TAG_FLOAT => Value::Float(cursor.f64()?),
                    TAG_TEXT => Value::Text(cursor.text()?),
                    tag => {
                        return Err(StoreError::InvalidFormat(format!(
                            "unknown value tag {}",
                            tag
                        )))
                    }
                };
                cursor.finish()?;
                Ok(Frame::Point {
                    node,
                    timestamp,
                    value,
                })
            }
            FrameKind::Packed => {
                let mut cursor = Cursor::new(payload);
                let node = cursor.u32()?;
                let count = cursor.u32()? as usize;
                let kind = match cursor.u8()? {
                    TAG_FLOAT => ValueKind::Float,
                    TAG_TEXT => ValueKind::Text,
                    tag => {
                        return Err(StoreError::InvalidFormat(format!(
                            "unknown column tag {}",
                            tag
                        )))
                    }
                };
                let level = cursor.u8()? as u32;
                let ts_len = cursor.u32()? as usize;
                let raw_ts = inflate(cursor.take(ts_len)?)?;
                let value_len = cursor.u32()? as usize;
                let raw_values = inflate(cursor.take(value_len)?)?;
                cursor.finish()?;

                if raw_ts.len() != count * TIMESTAMP_WIDTH {
                    return Err(StoreError::Corruption(format!(
                        "packed timestamps of node {}: {} bytes for {} cells",
                        node,
                        raw_ts.len(),
                        count
                    )));
                }
                let timestamps = raw_ts
                    .chunks_exact(TIMESTAMP_WIDTH)
                    .map(Timestamp::from_bytes)
                    .collect::<Result<Vec<_>>>()?;

                let mut cursor = Cursor::new(&raw_values);
                let values = match kind {
                    ValueKind::Float => {
                        let mut col = Vec::with_capacity(count);
                        for _ in 0..count {
                            col.push(cursor.f64()?);
                        }
                        Column::Float(col)
                    }
                    ValueKind::Text => {
                        let mut col = Vec::with_capacity(count);
                        for _ in 0..count {
                            col.push(cursor.text()?);
                        }
                        Column::Text(col)
                    }
                };
                cursor.finish()?;

                Ok(Frame::Packed {
                    node,
                    level,
                    timestamps,
                    values,
                })
            }
        }
    }
}

/// Header bytes of a new day-file. The flags byte is reserved.
pub fn header_bytes() -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(DAYFILE_MAGIC);
    header[4] = DAYFILE_VERSION;
    header
}

/// Write the day-file header in one call.
pub fn write_header(w: &mut impl Write) -> Result<()> {
    w.write_all(&header_bytes())?;
    Ok(())
}

/// Whether `buf` is a strict prefix of a header (including empty), as
/// left by a writer interrupted while creating the file.
pub fn is_partial_header(buf: &[u8]) -> bool {
    buf.len() < HEADER_SIZE && header_bytes().starts_with(buf)
}

/// Verify the day-file header.
pub fn check_header(buf: &[u8]) -> Result<()> {
    if buf.len() < HEADER_SIZE {
        return Err(StoreError::InvalidFormat("Truncated day-file header".into()));
    }
    if &buf[..4] != DAYFILE_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid day-file magic".into()));
    }
    if buf[4] != DAYFILE_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported day-file version: {}",
            buf[4]
        )));
    }
    Ok(())
}

/// Result of reading the next frame.
#[derive(Debug)]
pub enum Next {
    /// A complete, verified frame.
    Frame(Frame),
    /// Clean end of file.
    End,
    /// An incomplete or checksum-failing frame at `offset`.
    Torn { offset: usize, reason: String },
}

/// Sequential reader over the frames of an in-memory day-file.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    /// Create a reader over a complete file image. The header is verified.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        check_header(buf)?;
        Ok(Self {
            buf,
            offset: HEADER_SIZE,
        })
    }

    /// Offset just past the last complete frame.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Read the next frame.
    ///
    /// A payload that passes its checksum but fails to decode is an error,
    /// not a torn tail. So is a checksum mismatch with more data behind it.
    pub fn next_frame(&mut self) -> Result<Next> {
        let rest = &self.buf[self.offset..];
        if rest.is_empty() {
            return Ok(Next::End);
        }
        if rest.len() < 5 {
            return Ok(self.torn("truncated frame header"));
        }

        let kind_byte = rest[0];
        if kind_byte == 0 {
            return Ok(self.torn("zero-filled tail"));
        }
        let len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Ok(self.torn(&format!("frame length {} out of range", len)));
        }
        if rest.len() < len + FRAME_OVERHEAD {
            return Ok(self.torn("truncated frame"));
        }

        let payload = &rest[5..5 + len];
        let crc = &rest[5 + len..5 + len + 4];
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            // Valid-looking data follows, so this is not an interrupted write
            if rest.len() > len + FRAME_OVERHEAD {
                return Err(StoreError::ChecksumMismatch {
                    expected: stored,
                    got: computed,
                });
            }
            return Ok(self.torn(&format!(
                "checksum mismatch: expected {}, got {}",
                stored, computed
            )));
        }

        let kind = FrameKind::from_byte(kind_byte).ok_or_else(|| {
            StoreError::InvalidFormat(format!("unknown frame kind {}", kind_byte))
        })?;
        let frame = Frame::decode_payload(kind, payload)?;
        self.offset += len + FRAME_OVERHEAD;
        Ok(Next::Frame(frame))
    }

    fn torn(&self, reason: &str) -> Next {
        Next::Torn {
            offset: self.offset,
            reason: reason.to_string(),
        }
    }
}

fn kind_tag(kind: ValueKind) -> u8 {
    match kind {
        ValueKind::Float => TAG_FLOAT,
        ValueKind::Text => TAG_TEXT,
    }
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Text(t) => {
            buf.push(TAG_TEXT);
            encode_text(buf, t);
        }
    }
}

fn encode_text(buf: &mut Vec<u8>, text: &BoundedText) {
    let bytes = text.as_str().as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| StoreError::Corruption(format!("inflate failed: {}", e)))?;
    Ok(out)
}

/// Bounds-checked little-endian reader over a payload.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(StoreError::Corruption(format!(
                "payload ends at {} while reading {} bytes at {}",
                self.buf.len(),
                n,
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    fn text(&mut self) -> Result<BoundedText> {
        let b = self.take(2)?;
        let len = u16::from_le_bytes([b[0], b[1]]) as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::Corruption(format!("invalid text value: {}", e)))?;
        Ok(BoundedText::new(s))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(StoreError::Corruption(format!(
                "{} trailing payload bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
