//! Day-file handle: exclusive append access and read-only replay.

use crate::dayfile::format::{
    is_partial_header, write_header, AttrsFrame, ColumnsFrame, Frame, FrameReader, Next, NodeFrame,
    HEADER_SIZE,
};
use crate::dayfile::namespace::{Namespace, NodeId, Series};
use crate::error::{Result, StoreError};
use crate::types::{SeriesId, Timestamp, Value, ValueKind, STATIC_ATTRIBUTES};
use fs2::FileExt;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Handle to the columns of one series inside an open day-file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeriesHandle {
    node: NodeId,
}

impl SeriesHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// Result of replaying a day-file image.
struct Replay {
    namespace: Namespace,
    valid_len: u64,
    torn: Option<String>,
}

/// A day-file opened for appending.
///
/// The file is locked exclusively for the lifetime of the handle. Frames are
/// buffered and only guaranteed on disk after [`DayFile::close`].
pub struct DayFile {
    /// Path to the day-file.
    path: PathBuf,

    /// Buffered writer positioned at the end of the valid data.
    writer: BufWriter<File>,

    /// Replayed namespace tree.
    namespace: Namespace,

    /// Current file size (for diagnostics).
    size: u64,
}

impl DayFile {
    /// Open or create a day-file for appending.
    ///
    /// A torn tail left by an interrupted writer is truncated away. A file
    /// holding only part of a header is treated as new.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Self::lock(&file, &path)?;

        let file_size = file.metadata()?.len();
        let mut image = Vec::with_capacity(file_size as usize);
        file.read_to_end(&mut image)?;
        let replay = Self::replay(&image)?;
        if let Some(reason) = &replay.torn {
            warn!(
                path = %path.display(),
                discarded = file_size - replay.valid_len,
                reason = %reason,
                "Truncating torn tail of day-file"
            );
            file.set_len(replay.valid_len)?;
        }
        file.seek(SeekFrom::Start(replay.valid_len))?;

        // New file, or one whose header never made it to disk
        let size = if replay.valid_len == 0 {
            write_header(&mut file)?;
            file.sync_all()?;
            HEADER_SIZE as u64
        } else {
            replay.valid_len
        };
        let namespace = replay.namespace;

        debug!(
            path = %path.display(),
            series = namespace.series_count(),
            size,
            "Opened day-file"
        );

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            namespace,
            size,
        })
    }

    /// Read a day-file without modifying it.
    ///
    /// The file is locked exclusively while it is read. A torn tail is
    /// reported and ignored.
    pub fn read(path: impl AsRef<Path>) -> Result<Namespace> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        Self::lock(&file, path)?;

        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        let _ = file.unlock();

        let replay = Self::replay(&image)?;
        if let Some(reason) = &replay.torn {
            warn!(
                path = %path.display(),
                ignored = image.len() as u64 - replay.valid_len,
                reason = %reason,
                "Ignoring torn tail of day-file"
            );
        }
        Ok(replay.namespace)
    }

    /// Write a namespace to a new file as packed, compressed columns.
    ///
    /// Any existing file at `path` is replaced. Returns the written size.
    pub fn write_packed(path: impl AsRef<Path>, namespace: &Namespace, level: u32) -> Result<u64> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::lock(&file, path)?;
        file.set_len(0)?;

        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        let mut size = HEADER_SIZE as u64;

        for (id, node) in namespace.nodes() {
            if let Some(parent) = node.parent {
                let frame = Frame::Node(NodeFrame {
                    id: id.0,
                    parent: parent.0,
                    name: node.name.clone(),
                });
                size += write_frame(&mut writer, &frame)?;
            }
            if !node.attrs.is_empty() {
                let frame = Frame::Attrs(AttrsFrame {
                    node: id.0,
                    attrs: node.attrs.clone(),
                });
                size += write_frame(&mut writer, &frame)?;
            }
            if let Some(series) = &node.series {
                let frame = Frame::Columns(ColumnsFrame {
                    node: id.0,
                    kind: series.kind(),
                });
                size += write_frame(&mut writer, &frame)?;
                if !series.is_empty() {
                    let frame = Frame::Packed {
                        node: id.0,
                        level,
                        timestamps: series.timestamps().to_vec(),
                        values: series.values().clone(),
                    };
                    size += write_frame(&mut writer, &frame)?;
                }
            }
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let _ = file.unlock();
        Ok(size)
    }

    /// Path to the day-file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file including buffered frames.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The namespace tree as of the last write.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Get or create the `domain/entity` path of a series and refresh its
    /// static attributes.
    ///
    /// Existing columns are never touched. The column pair itself is
    /// created by the first [`DayFile::append`], which binds its value kind.
    pub fn ensure_series(
        &mut self,
        series_id: &SeriesId,
        attributes: &Map<String, JsonValue>,
    ) -> Result<SeriesHandle> {
        let domain = series_id.domain();
        let domain_node = self.ensure_node(NodeId::ROOT, &domain)?;
        let node = self.ensure_node(domain_node, series_id.as_str())?;

        let mut update = BTreeMap::new();
        for key in STATIC_ATTRIBUTES {
            if let Some(value) = attributes.get(key) {
                update.insert(key.to_string(), value.clone());
            }
        }
        update.insert("domain".to_string(), JsonValue::String(domain));
        update.insert(
            "entity_id".to_string(),
            JsonValue::String(series_id.as_str().to_string()),
        );

        let current = &self.namespace.get(node)?.attrs;
        update.retain(|key, value| current.get(key) != Some(&*value));
        if !update.is_empty() {
            let frame = Frame::Attrs(AttrsFrame {
                node: node.0,
                attrs: update.clone(),
            });
            self.size += write_frame(&mut self.writer, &frame)?;
            self.namespace.get_mut(node)?.attrs.extend(update);
        }

        Ok(SeriesHandle { node })
    }

    /// Append one observation to a series.
    ///
    /// The first append binds the value kind from `raw`. Later values are
    /// coerced to that kind; a non-numeric value on a float series is stored
    /// as NaN. Returns the stored value.
    pub fn append(
        &mut self,
        handle: SeriesHandle,
        timestamp: &Timestamp,
        raw: &str,
    ) -> Result<Value> {
        let existing = self.namespace.get(handle.node)?.series.as_ref().map(Series::kind);
        let kind = match existing {
            Some(kind) => kind,
            None => {
                let kind = ValueKind::infer(raw);
                let frame = Frame::Columns(ColumnsFrame {
                    node: handle.node.0,
                    kind,
                });
                self.size += write_frame(&mut self.writer, &frame)?;
                self.namespace.get_mut(handle.node)?.series = Some(Series::new(kind));
                kind
            }
        };

        let value = Value::coerce(kind, raw);
        if kind == ValueKind::Float && value.as_f64().map_or(false, f64::is_nan) {
            debug!(node = handle.node.0, raw, "Non-numeric value on float series, storing NaN");
        }

        let frame = Frame::Point {
            node: handle.node.0,
            timestamp: timestamp.clone(),
            value: value.clone(),
        };
        self.size += write_frame(&mut self.writer, &frame)?;
        apply_point(&mut self.namespace, handle.node, timestamp.clone(), value.clone())?;
        Ok(value)
    }

    /// Flush, sync and unlock the day-file.
    pub fn close(self) -> Result<()> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let _ = file.unlock();
        debug!(path = %self.path.display(), size = self.size, "Closed day-file");
        Ok(())
    }

    fn ensure_node(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        if let Some(id) = self.namespace.child(parent, name) {
            return Ok(id);
        }
        let id = self.namespace.next_id();
        let frame = Frame::Node(NodeFrame {
            id: id.0,
            parent: parent.0,
            name: name.to_string(),
        });
        self.size += write_frame(&mut self.writer, &frame)?;
        self.namespace.insert(id, parent, name)?;
        Ok(id)
    }

    fn lock(file: &File, path: &Path) -> Result<()> {
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(path.display().to_string()))
    }

    /// Rebuild the namespace from a file image.
    fn replay(image: &[u8]) -> Result<Replay> {
        if is_partial_header(image) {
            return Ok(Replay {
                namespace: Namespace::new(),
                valid_len: 0,
                torn: (!image.is_empty()).then(|| "truncated header".to_string()),
            });
        }

        let mut reader = FrameReader::new(image)?;
        let mut namespace = Namespace::new();

        let torn = loop {
            match reader.next_frame()? {
                Next::Frame(frame) => apply_frame(&mut namespace, frame)?,
                Next::End => break None,
                Next::Torn { reason, .. } => break Some(reason),
            }
        };

        Ok(Replay {
            namespace,
            valid_len: reader.offset() as u64,
            torn,
        })
    }
}

fn write_frame(writer: &mut BufWriter<File>, frame: &Frame) -> Result<u64> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes)?;
    Ok(bytes.len() as u64)
}

fn apply_frame(namespace: &mut Namespace, frame: Frame) -> Result<()> {
    match frame {
        Frame::Node(f) => namespace.insert(NodeId(f.id), NodeId(f.parent), &f.name),
        Frame::Attrs(f) => {
            namespace.get_mut(NodeId(f.node))?.attrs.extend(f.attrs);
            Ok(())
        }
        Frame::Columns(f) => {
            let node = namespace.get_mut(NodeId(f.node))?;
            if node.series.is_some() {
                return Err(StoreError::Corruption(format!(
                    "columns of node {} created twice",
                    f.node
                )));
            }
            node.series = Some(Series::new(f.kind));
            Ok(())
        }
        Frame::Point {
            node,
            timestamp,
            value,
        } => apply_point(namespace, NodeId(node), timestamp, value),
        Frame::Packed {
            node,
            timestamps,
            values,
            ..
        } => {
            let id = NodeId(node);
            let series_name = namespace.get(id)?.name.clone();
            let series = namespace
                .get_mut(id)?
                .series
                .as_mut()
                .ok_or_else(|| {
                    StoreError::Corruption(format!("packed block for node {} without columns", node))
                })?;
            let expected = series.kind();
            series
                .extend(timestamps, values)
                .map_err(|got| StoreError::SeriesKindMismatch {
                    series: series_name,
                    expected,
                    got,
                })
        }
    }
}

fn apply_point(
    namespace: &mut Namespace,
    node: NodeId,
    timestamp: Timestamp,
    value: Value,
) -> Result<()> {
    let target = namespace.get_mut(node)?;
    let series_name = target.name.clone();
    let series = target
        .series
        .as_mut()
        .ok_or_else(|| {
            StoreError::Corruption(format!("point for node {} without columns", node.0))
        })?;
    let expected = series.kind();
    series
        .push(timestamp, value)
        .map_err(|got| StoreError::SeriesKindMismatch {
            series: series_name,
            expected,
            got,
        })
}
