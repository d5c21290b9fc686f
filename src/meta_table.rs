// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, Encode},
    file::{rewrite_atomic, MAGIC_BYTES},
    meta::MetaEntry,
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt};
use crossbeam_skiplist::SkipMap;
use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    ops::Bound,
    path::{Path, PathBuf},
};
use xxhash_rust::xxh3::xxh3_64;

const HEADER_LEN: usize = 16;

const OP_PUT: u8 = 0;
const OP_DEL: u8 = 1;

const CHECKSUM_LEN: usize = 8;

/// The metadata store: an ordered in-memory table of [`MetaEntry`] records
/// backed by a write-through journal file.
///
/// Every mutation appends a checksummed frame to the journal; opening
/// replays it. A torn tail (crash mid-append) is truncated with a warning;
/// whatever it contained is reconstructed by the next bootstrap. Closing
/// compacts the journal down to one `PUT` frame per live entry.
pub struct MetaTable {
    items: SkipMap<Slice, MetaEntry>,
    file: File,
    path: PathBuf,
    key_len: usize,
}

impl MetaTable {
    /// Creates a fresh, empty table; the journal file must not exist yet.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn create(path: &Path, key_len: u16) -> crate::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        file.write_all(&header(key_len))?;

        Ok(Self {
            items: SkipMap::new(),
            file,
            path: path.into(),
            key_len: usize::from(key_len),
        })
    }

    /// Opens an existing table by replaying its journal.
    ///
    /// # Errors
    ///
    /// Fails on I/O error or a malformed journal header.
    pub fn open(path: &Path, key_len: u16) -> crate::Result<Self> {
        let buf = std::fs::read(path)?;

        let Some(head) = buf.get(..HEADER_LEN) else {
            return Err(DecodeError::InvalidHeader("metadata table").into());
        };

        if head[..3] != MAGIC_BYTES[..3] {
            return Err(DecodeError::InvalidHeader("metadata table").into());
        }
        if head[3] != MAGIC_BYTES[3] {
            return Err(DecodeError::InvalidVersion.into());
        }

        let mut key_len_field = &head[4..6];
        let stored_key_len = key_len_field
            .read_u16::<BigEndian>()
            .map_err(DecodeError::from)?;
        if stored_key_len != key_len {
            return Err(DecodeError::InvalidHeader("metadata table").into());
        }

        let items = SkipMap::new();
        let valid = replay(&buf, usize::from(key_len), &items);

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        if valid < buf.len() {
            log::warn!(
                "metadata journal {path:?} has a torn tail ({} bytes dropped)",
                buf.len() - valid,
            );
            file.set_len(valid as u64)?;
        }

        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            items,
            file,
            path: path.into(),
            key_len: usize::from(key_len),
        })
    }

    /// Looks up the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<MetaEntry> {
        self.items.get(key).map(|e| e.value().clone())
    }

    /// Whether an entry for `key` exists.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.items.contains_key(key)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts an entry that must not exist yet.
    ///
    /// # Errors
    ///
    /// Fails if the key is already present, or on I/O error.
    pub fn add_unique(&mut self, entry: MetaEntry) -> crate::Result<()> {
        if self.contains(&entry.key) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "metadata key already exists",
            )
            .into());
        }
        self.put(entry)
    }

    /// Upserts an entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn put(&mut self, entry: MetaEntry) -> crate::Result<()> {
        self.file.write_all(&put_frame(&entry))?;
        self.items.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Bulk upsert: one journal write for the whole batch.
    ///
    /// The batch is sorted by key first (the journal does not care, but
    /// downstream replay and disk layout do), and every entry's `last_wrote`
    /// is set to `timestamp`.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn put_multiple(&mut self, mut entries: Vec<MetaEntry>, timestamp: u16) -> crate::Result<()> {
        entries.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        let mut buf = Vec::with_capacity(
            entries.len() * (1 + self.key_len + MetaEntry::FIXED_WIDTH + CHECKSUM_LEN),
        );
        for entry in &mut entries {
            entry.last_wrote = timestamp;
            buf.extend_from_slice(&put_frame(entry));
        }

        self.file.write_all(&buf)?;

        for entry in entries {
            self.items.insert(entry.key.clone(), entry);
        }

        Ok(())
    }

    /// Removes and returns the entry for `key`.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn remove(&mut self, key: &[u8]) -> crate::Result<Option<MetaEntry>> {
        let Some(entry) = self.items.remove(key) else {
            return Ok(None);
        };

        self.file.write_all(&del_frame(key))?;

        Ok(Some(entry.value().clone()))
    }

    /// Entry with the smallest key.
    #[must_use]
    pub fn first(&self) -> Option<MetaEntry> {
        self.items.front().map(|e| e.value().clone())
    }

    /// First entry whose key is `>= key`.
    #[must_use]
    pub fn at_or_after(&self, key: &[u8]) -> Option<MetaEntry> {
        self.items
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|e| e.value().clone())
    }

    /// First entry whose key is `> key`.
    #[must_use]
    pub fn after(&self, key: &[u8]) -> Option<MetaEntry> {
        self.items
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|e| e.value().clone())
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = MetaEntry> + '_ {
        self.items.iter().map(|e| e.value().clone())
    }

    /// Flushes the journal to disk.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn sync(&mut self) -> crate::Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Compacts the journal down to the live entries and syncs it.
    ///
    /// # Errors
    ///
    /// Fails on I/O error.
    pub fn close(&mut self) -> crate::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = header(self.key_len as u16).to_vec();

        for entry in self.items.iter() {
            buf.extend_from_slice(&put_frame(entry.value()));
        }

        rewrite_atomic(&self.path, &buf)?;
        Ok(())
    }
}

fn header(key_len: u16) -> [u8; HEADER_LEN] {
    let mut head = [0u8; HEADER_LEN];
    head[..4].copy_from_slice(&MAGIC_BYTES);
    head[4..6].copy_from_slice(&key_len.to_be_bytes());
    head
}

fn put_frame(entry: &MetaEntry) -> Vec<u8> {
    let mut frame = vec![OP_PUT];

    // NOTE: Writing into a Vec cannot fail
    #[allow(clippy::expect_used)]
    entry.encode_into(&mut frame).expect("cannot fail");

    frame.extend_from_slice(&xxh3_64(&frame).to_be_bytes());
    frame
}

fn del_frame(key: &[u8]) -> Vec<u8> {
    let mut frame = vec![OP_DEL];
    frame.extend_from_slice(key);
    frame.extend_from_slice(&xxh3_64(&frame).to_be_bytes());
    frame
}

/// Replays journal frames into `items`, returning the number of bytes
/// that parsed cleanly.
fn replay(buf: &[u8], key_len: usize, items: &SkipMap<Slice, MetaEntry>) -> usize {
    let mut pos = HEADER_LEN;

    while pos < buf.len() {
        let op = buf[pos];

        let payload_len = match op {
            OP_PUT => key_len + MetaEntry::FIXED_WIDTH,
            OP_DEL => key_len,
            _ => break,
        };

        let frame_len = 1 + payload_len + CHECKSUM_LEN;
        let Some(frame) = buf.get(pos..pos + frame_len) else {
            break;
        };

        let (body, checksum) = frame.split_at(1 + payload_len);

        // NOTE: split_at yields exactly CHECKSUM_LEN bytes here
        #[allow(clippy::expect_used)]
        let expected = u64::from_be_bytes(checksum.try_into().expect("checksum is 8 bytes"));

        if xxh3_64(body) != expected {
            break;
        }

        match op {
            OP_PUT => {
                let Ok(entry) = MetaEntry::decode_from(&mut &body[1..], key_len) else {
                    break;
                };
                items.insert(entry.key.clone(), entry);
            }
            OP_DEL => {
                items.remove(&body[1..]);
            }
            _ => unreachable!(),
        }

        pos += frame_len;
    }

    pos
}
