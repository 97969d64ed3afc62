//! Append-only block and undo files.
//!
//! Records are framed with a 4-byte little-endian length and addressed by
//! `(file_id, offset)`. A file is rolled over once the next record would push
//! it past `max_file_size`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chaind_primitives::encoding::{DecodeError, Decoder, Encoder};

pub const BLOCK_FILE_PREFIX: &str = "blk";
pub const UNDO_FILE_PREFIX: &str = "rev";

const FRAME_HEADER_LEN: u64 = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub const ENCODED_LEN: usize = 16;

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.file_id);
        encoder.write_u64_le(self.offset);
        encoder.write_u32_le(self.len);
    }

    pub fn read(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let file_id = decoder.read_u32_le()?;
        let offset = decoder.read_u64_le()?;
        let len = decoder.read_u32_le()?;
        if len == 0 {
            return Err(DecodeError::InvalidData("empty flat file record"));
        }
        Ok(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch { expected: u32, found: u32 },
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "flat file i/o: {err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flat file location"),
            FlatFileError::LengthMismatch { expected, found } => {
                write!(f, "flat file record length {found}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    cursor: Mutex<WriteCursor>,
}

#[derive(Debug, Clone, Copy)]
struct WriteCursor {
    file_id: u32,
    len: u64,
}

impl FlatFileStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let cursor = find_write_cursor(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            cursor: Mutex::new(cursor),
        })
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Appends one record and returns where it landed.
    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let len = u32::try_from(bytes.len()).map_err(|_| FlatFileError::InvalidLocation)?;
        if len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| FlatFileError::Io(std::io::Error::other("flat file lock poisoned")))?;
        let needed = FRAME_HEADER_LEN + u64::from(len);
        if cursor.len > 0 && cursor.len + needed > self.max_file_size {
            cursor.file_id += 1;
            cursor.len = 0;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(cursor.file_id))?;
        let mut frame = Vec::with_capacity(needed as usize);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(bytes);
        file.write_all(&frame)?;

        let location = FileLocation {
            file_id: cursor.file_id,
            offset: cursor.len,
            len,
        };
        cursor.len += needed;
        Ok(location)
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let mut file = File::open(self.path_for(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut prefix = [0u8; 4];
        file.read_exact(&mut prefix)?;
        let found = u32::from_le_bytes(prefix);
        if found != location.len {
            return Err(FlatFileError::LengthMismatch {
                expected: location.len,
                found,
            });
        }
        let mut buffer = vec![0u8; found as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Forces the file currently being appended to onto stable storage.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        let cursor = *self
            .cursor
            .lock()
            .map_err(|_| FlatFileError::Io(std::io::Error::other("flat file lock poisoned")))?;
        let path = self.path_for(cursor.file_id);
        if path.exists() {
            OpenOptions::new().append(true).open(path)?.sync_data()?;
        }
        Ok(())
    }

    fn path_for(&self, file_id: u32) -> PathBuf {
        file_path(&self.dir, &self.prefix, file_id)
    }
}

fn file_path(dir: &Path, prefix: &str, file_id: u32) -> PathBuf {
    dir.join(format!("{prefix}{file_id:05}.dat"))
}

fn find_write_cursor(
    dir: &Path,
    prefix: &str,
    max_file_size: u64,
) -> Result<WriteCursor, FlatFileError> {
    let mut last = None;
    let mut file_id = 0u32;
    loop {
        let path = file_path(dir, prefix, file_id);
        if !path.exists() {
            break;
        }
        last = Some(WriteCursor {
            file_id,
            len: std::fs::metadata(&path)?.len(),
        });
        file_id += 1;
    }
    Ok(match last {
        Some(cursor) if cursor.len >= max_file_size => WriteCursor {
            file_id: cursor.file_id + 1,
            len: 0,
        },
        Some(cursor) => cursor,
        None => WriteCursor { file_id: 0, len: 0 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_roll_over_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::open(dir.path(), BLOCK_FILE_PREFIX, 64).expect("open");

        let first = store.append(&[1u8; 40]).expect("append");
        let second = store.append(&[2u8; 40]).expect("append");
        assert_eq!(first.file_id, 0);
        assert_eq!(second.file_id, 1);
        assert_eq!(second.offset, 0);
        assert_eq!(store.read(second).expect("read"), vec![2u8; 40]);

        let reopened = FlatFileStore::open(dir.path(), BLOCK_FILE_PREFIX, 64).expect("reopen");
        let third = reopened.append(&[3u8; 4]).expect("append");
        assert_eq!(third.file_id, 1);
        assert_eq!(third.offset, 44);
    }

    #[test]
    fn wrong_length_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::open(dir.path(), UNDO_FILE_PREFIX, 1 << 20).expect("open");
        let mut location = store.append(b"undo").expect("append");
        location.len += 1;
        assert!(matches!(
            store.read(location),
            Err(FlatFileError::LengthMismatch {
                expected: 5,
                found: 4
            })
        ));
    }
}
