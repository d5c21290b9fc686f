// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{coding::DecodeError, file::MAGIC_BYTES, Slice};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

const HEADER_LEN: u64 = 16;

/// One slot's content: the key column and the opaque collection blob.
#[derive(Clone, Debug)]
pub struct Record {
    /// Key column; all zeroes marks a deleted slot
    pub key: Slice,

    /// Serialized collection blob
    pub blob: Slice,
}

/// A fixed-width record file.
///
/// After a 16-byte header every record occupies `key_len + blob_len` bytes.
/// A record whose key column is zeroed is deleted; its slot is reused by
/// later appends. The free list is rebuilt by a single key-column scan at
/// open time.
pub struct ArrayFile {
    file: File,
    path: PathBuf,
    key_len: usize,
    blob_len: usize,
    slot_count: u32,
    free_slots: Vec<u32>,
}

impl ArrayFile {
    /// Opens or creates an array file.
    ///
    /// # Errors
    ///
    /// Fails on I/O error, on a malformed header, or when the header
    /// disagrees with the expected record shape.
    pub fn open(
        path: &Path,
        key_len: u16,
        blob_len: u32,
        initial_slots: u32,
    ) -> crate::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let record_len = u64::from(key_len) + u64::from(blob_len);

        if file_len == 0 {
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            header.extend_from_slice(&MAGIC_BYTES);
            header.write_u16::<BigEndian>(key_len)?;
            header.write_u32::<BigEndian>(blob_len)?;
            header.resize(HEADER_LEN as usize, 0);

            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header)?;

            if initial_slots > 0 {
                // preallocated slots read back as deleted and land on the free list
                file.set_len(HEADER_LEN + u64::from(initial_slots) * record_len)?;
            }
        } else {
            let mut header = [0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;

            let mut reader = &header[..];

            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic).map_err(DecodeError::from)?;

            if magic[..3] != MAGIC_BYTES[..3] {
                return Err(DecodeError::InvalidHeader("array file").into());
            }
            if magic[3] != MAGIC_BYTES[3] {
                return Err(DecodeError::InvalidVersion.into());
            }

            let stored_key_len = reader.read_u16::<BigEndian>().map_err(DecodeError::from)?;
            let stored_blob_len = reader.read_u32::<BigEndian>().map_err(DecodeError::from)?;

            if stored_key_len != key_len || stored_blob_len != blob_len {
                return Err(crate::Error::Corruption(format!(
                    "array file {path:?} header says record shape {stored_key_len}+{stored_blob_len}, expected {key_len}+{blob_len}",
                )));
            }
        }

        let file_len = file.metadata()?.len();

        // a torn append leaves a partial trailing record, which simply
        // does not count as a slot
        #[allow(clippy::cast_possible_truncation)]
        let slot_count = (file_len.saturating_sub(HEADER_LEN) / record_len) as u32;

        let mut this = Self {
            file,
            path: path.into(),
            key_len: usize::from(key_len),
            blob_len: blob_len as usize,
            slot_count,
            free_slots: Vec::new(),
        };
        this.rebuild_free_list()?;

        Ok(this)
    }

    fn rebuild_free_list(&mut self) -> crate::Result<()> {
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(HEADER_LEN))?;

        let mut key = vec![0u8; self.key_len];

        for slot in 0..self.slot_count {
            reader.read_exact(&mut key)?;
            reader.seek_relative(self.blob_len as i64)?;

            if key.iter().all(|&b| b == 0) {
                self.free_slots.push(slot);
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total slot count, including deleted slots.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.slot_count
    }

    /// Returns `true` if the file holds no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot_count == 0
    }

    /// Number of deleted slots available for reuse.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn free(&self) -> u32 {
        self.free_slots.len() as u32
    }

    fn offset(&self, slot: u32) -> u64 {
        HEADER_LEN + u64::from(slot) * (self.key_len + self.blob_len) as u64
    }

    /// Reads a slot; `None` if the slot does not exist.
    ///
    /// Deleted slots are returned as-is (their key column is zeroed);
    /// interpreting that is the caller's business.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn get(&mut self, slot: u32) -> crate::Result<Option<Record>> {
        if slot >= self.slot_count {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.key_len + self.blob_len];
        self.file.seek(SeekFrom::Start(self.offset(slot)))?;
        self.file.read_exact(&mut buf)?;

        Ok(Some(Record {
            key: Slice::new(&buf[..self.key_len]),
            blob: Slice::new(&buf[self.key_len..]),
        }))
    }

    /// Writes a record into a reused or fresh slot, returning its index.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    ///
    /// # Panics
    ///
    /// Panics if key or blob width does not match the record shape.
    pub fn add(&mut self, key: &[u8], blob: &[u8]) -> crate::Result<u32> {
        if let Some(slot) = self.free_slots.pop() {
            self.write_record(slot, key, blob)?;
            Ok(slot)
        } else {
            let slot = self.slot_count;
            self.write_record(slot, key, blob)?;
            self.slot_count += 1;
            Ok(slot)
        }
    }

    /// Overwrites an existing slot.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not exist or widths do not match.
    pub fn set(&mut self, slot: u32, key: &[u8], blob: &[u8]) -> crate::Result<()> {
        assert!(slot < self.slot_count, "slot out of range");
        self.write_record(slot, key, blob)
    }

    fn write_record(&mut self, slot: u32, key: &[u8], blob: &[u8]) -> crate::Result<()> {
        assert_eq!(self.key_len, key.len(), "key width does not match");
        assert_eq!(self.blob_len, blob.len(), "blob width does not match");
        debug_assert!(key.iter().any(|&b| b != 0), "zero key would read as deleted");

        self.file.seek(SeekFrom::Start(self.offset(slot)))?;
        self.file.write_all(key)?;
        self.file.write_all(blob)?;
        Ok(())
    }

    /// Marks a slot deleted by zeroing its key column.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn remove(&mut self, slot: u32) -> crate::Result<()> {
        if slot >= self.slot_count {
            return Ok(());
        }

        // do not double-push onto the free list
        let mut key = vec![0u8; self.key_len];
        self.file.seek(SeekFrom::Start(self.offset(slot)))?;
        self.file.read_exact(&mut key)?;

        if key.iter().all(|&b| b == 0) {
            return Ok(());
        }

        let zeroes = vec![0u8; self.key_len];
        self.file.seek(SeekFrom::Start(self.offset(slot)))?;
        self.file.write_all(&zeroes)?;

        self.free_slots.push(slot);
        Ok(())
    }

    /// Iterates over all live slots in slot order.
    ///
    /// # Errors
    ///
    /// The iterator yields an `Err` item on I/O error and then fuses.
    pub fn scan(&mut self) -> crate::Result<Scan<'_>> {
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(HEADER_LEN))?;

        Ok(Scan {
            reader,
            slot: 0,
            slot_count: self.slot_count,
            key_len: self.key_len,
            blob_len: self.blob_len,
            failed: false,
        })
    }

    /// Flushes file contents to disk.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn sync(&mut self) -> crate::Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Lazy iterator over the live slots of an [`ArrayFile`].
pub struct Scan<'a> {
    reader: BufReader<&'a File>,
    slot: u32,
    slot_count: u32,
    key_len: usize,
    blob_len: usize,
    failed: bool,
}

impl Iterator for Scan<'_> {
    type Item = crate::Result<(u32, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if self.slot >= self.slot_count {
                return None;
            }

            let slot = self.slot;
            self.slot += 1;

            let mut buf = vec![0u8; self.key_len + self.blob_len];
            if let Err(e) = self.reader.read_exact(&mut buf) {
                self.failed = true;
                return Some(Err(e.into()));
            }

            if buf[..self.key_len].iter().all(|&b| b == 0) {
                continue;
            }

            return Some(Ok((
                slot,
                Record {
                    key: Slice::new(&buf[..self.key_len]),
                    blob: Slice::new(&buf[self.key_len..]),
                },
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    const KEY_LEN: u16 = 4;
    const BLOB_LEN: u32 = 8;

    fn blob(fill: u8) -> Vec<u8> {
        vec![fill; BLOB_LEN as usize]
    }

    #[test]
    fn add_get_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.kca");

        let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;

        let a = array.add(b"aaaa", &blob(1))?;
        let b = array.add(b"bbbb", &blob(2))?;
        assert_eq!((0, 1), (a, b));
        assert_eq!(2, array.len());
        assert_eq!(0, array.free());

        let record = array.get(a)?.expect("exists");
        assert_eq!(record.key, *b"aaaa".as_slice());
        assert_eq!(record.blob, *blob(1).as_slice());

        assert!(array.get(99)?.is_none());

        Ok(())
    }

    #[test]
    fn remove_and_reuse() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.kca");

        let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;
        array.add(b"aaaa", &blob(1))?;
        let b = array.add(b"bbbb", &blob(2))?;
        array.add(b"cccc", &blob(3))?;

        array.remove(b)?;
        assert_eq!(1, array.free());

        // double remove is a no-op
        array.remove(b)?;
        assert_eq!(1, array.free());

        let d = array.add(b"dddd", &blob(4))?;
        assert_eq!(b, d);
        assert_eq!(3, array.len());
        assert_eq!(0, array.free());

        Ok(())
    }

    #[test]
    fn scan_skips_deleted() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.kca");

        let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;
        array.add(b"aaaa", &blob(1))?;
        let b = array.add(b"bbbb", &blob(2))?;
        array.add(b"cccc", &blob(3))?;
        array.remove(b)?;

        let slots = array
            .scan()?
            .collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(2, slots.len());
        assert_eq!(0, slots[0].0);
        assert_eq!(2, slots[1].0);
        assert_eq!(slots[1].1.key, *b"cccc".as_slice());

        Ok(())
    }

    #[test]
    fn reopen_rebuilds_free_list() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.kca");

        {
            let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;
            array.add(b"aaaa", &blob(1))?;
            let b = array.add(b"bbbb", &blob(2))?;
            array.remove(b)?;
            array.sync()?;
        }

        let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;
        assert_eq!(2, array.len());
        assert_eq!(1, array.free());

        // the freed slot is reused
        assert_eq!(1, array.add(b"eeee", &blob(5))?);

        Ok(())
    }

    #[test]
    fn preallocation_fills_free_list() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.kca");

        let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 8)?;
        assert_eq!(8, array.len());
        assert_eq!(8, array.free());
        assert_eq!(0, array.scan()?.count());

        let slot = array.add(b"aaaa", &blob(1))?;
        assert!(slot < 8);
        assert_eq!(7, array.free());

        Ok(())
    }

    #[test]
    fn reopen_with_wrong_shape_fails() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.kca");

        ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;

        assert!(matches!(
            ArrayFile::open(&path, KEY_LEN, BLOB_LEN + 1, 0),
            Err(crate::Error::Corruption(_)),
        ));

        Ok(())
    }

    #[test]
    fn torn_trailing_record_is_ignored() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.kca");

        {
            let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;
            array.add(b"aaaa", &blob(1))?;
        }

        // simulate a crash mid-append
        let file = OpenOptions::new().append(true).open(&path)?;
        file.set_len(HEADER_LEN + 12 + 5)?;

        let mut array = ArrayFile::open(&path, KEY_LEN, BLOB_LEN, 0)?;
        assert_eq!(1, array.len());
        assert_eq!(1, array.scan()?.count());

        Ok(())
    }
}
