//! Per-file usage statistics for the block and undo flat files.

use std::collections::{BTreeMap, BTreeSet};

use chaind_primitives::encoding::{DecodeError, Decoder, Encoder};
use chaind_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flatfiles::FileLocation;

pub const META_BLOCK_FILES_LAST_FILE_KEY: &[u8] = b"flatfiles:blocks:last_file";
pub const META_UNDO_FILES_LAST_FILE_KEY: &[u8] = b"flatfiles:undo:last_file";

const META_BLOCK_FILE_INFO_PREFIX: &[u8] = b"flatfiles:blocks:file:";
const META_UNDO_FILE_INFO_PREFIX: &[u8] = b"flatfiles:undo:file:";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlatFileInfo {
    pub blocks: u32,
    pub size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl FlatFileInfo {
    pub fn add_record(&mut self, height: i32, time: u32, bytes: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        self.size += bytes;
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(32);
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le()?,
            size: decoder.read_u64_le()?,
            height_first: decoder.read_i32_le()?,
            height_last: decoder.read_i32_le()?,
            time_first: decoder.read_u32_le()?,
            time_last: decoder.read_u32_le()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(info)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Blocks,
    Undo,
}

impl FileKind {
    fn prefix(self) -> &'static [u8] {
        match self {
            FileKind::Blocks => META_BLOCK_FILE_INFO_PREFIX,
            FileKind::Undo => META_UNDO_FILE_INFO_PREFIX,
        }
    }

    fn last_file_key(self) -> &'static [u8] {
        match self {
            FileKind::Blocks => META_BLOCK_FILES_LAST_FILE_KEY,
            FileKind::Undo => META_UNDO_FILES_LAST_FILE_KEY,
        }
    }
}

pub fn file_info_key(kind: FileKind, file_id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(kind.prefix().len() + 4);
    key.extend_from_slice(kind.prefix());
    key.extend_from_slice(&file_id.to_le_bytes());
    key
}

pub fn parse_file_info_key(kind: FileKind, key: &[u8]) -> Option<u32> {
    let id = key.strip_prefix(kind.prefix())?;
    Some(u32::from_le_bytes(id.try_into().ok()?))
}

/// In-memory view of the file statistics with the set of files changed since
/// the last write.
#[derive(Debug, Default)]
pub struct FileInfoTracker {
    blocks: BTreeMap<u32, FlatFileInfo>,
    undo: BTreeMap<u32, FlatFileInfo>,
    dirty: BTreeSet<(u8, u32)>,
}

impl FileInfoTracker {
    pub fn load<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        let mut tracker = Self::default();
        for kind in [FileKind::Blocks, FileKind::Undo] {
            for (key, value) in store.scan_prefix(Column::Meta, kind.prefix())? {
                let Some(file_id) = parse_file_info_key(kind, &key) else {
                    continue;
                };
                let info = FlatFileInfo::decode(&value).map_err(|err| {
                    StoreError::Backend(format!("corrupt file info {file_id}: {err}"))
                })?;
                tracker.map_mut(kind).insert(file_id, info);
            }
        }
        Ok(tracker)
    }

    pub fn record(&mut self, kind: FileKind, location: FileLocation, height: i32, time: u32) {
        self.map_mut(kind)
            .entry(location.file_id)
            .or_default()
            .add_record(height, time, u64::from(location.len) + 4);
        self.dirty.insert((kind as u8, location.file_id));
    }

    pub fn info(&self, kind: FileKind, file_id: u32) -> Option<&FlatFileInfo> {
        match kind {
            FileKind::Blocks => self.blocks.get(&file_id),
            FileKind::Undo => self.undo.get(&file_id),
        }
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Moves every changed file record into `batch`.
    pub fn write_dirty(&mut self, batch: &mut WriteBatch) {
        for (kind_tag, file_id) in std::mem::take(&mut self.dirty) {
            let kind = if kind_tag == FileKind::Blocks as u8 {
                FileKind::Blocks
            } else {
                FileKind::Undo
            };
            if let Some(info) = self.info(kind, file_id) {
                batch.put(Column::Meta, file_info_key(kind, file_id), info.encode());
            }
            if let Some(last) = self.map(kind).keys().next_back() {
                batch.put(Column::Meta, kind.last_file_key(), last.to_le_bytes());
            }
        }
    }

    fn map(&self, kind: FileKind) -> &BTreeMap<u32, FlatFileInfo> {
        match kind {
            FileKind::Blocks => &self.blocks,
            FileKind::Undo => &self.undo,
        }
    }

    fn map_mut(&mut self, kind: FileKind) -> &mut BTreeMap<u32, FlatFileInfo> {
        match kind {
            FileKind::Blocks => &mut self.blocks,
            FileKind::Undo => &mut self.undo,
        }
    }
}
