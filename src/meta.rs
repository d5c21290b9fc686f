// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, Encode, EncodeError},
    time, Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Per-key metadata record pointing at the array slot holding the key's
/// row collection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetaEntry {
    /// The indexed key
    pub key: Slice,

    /// Payload row width in bytes at time of write
    pub chunk_size: u16,

    /// Live rows in the collection
    pub chunk_count: u32,

    /// Partition containing the collection
    pub cluster_idx: u8,

    /// Reserved, zero
    pub flags: u8,

    /// Slot index inside the array file
    pub index_pos: u32,

    /// Last read access, in days since 2000-01-01
    pub last_read: u16,

    /// Last write access, in days since 2000-01-01
    pub last_wrote: u16,
}

impl MetaEntry {
    /// Encoded size behind the key bytes.
    pub const FIXED_WIDTH: usize = 16;

    /// Creates an entry stamped with today's date.
    #[must_use]
    pub fn new(key: Slice, chunk_size: u16, chunk_count: u32, cluster_idx: u8, index_pos: u32) -> Self {
        let today = time::today();

        Self {
            key,
            chunk_size,
            chunk_count,
            cluster_idx,
            flags: 0,
            index_pos,
            last_read: today,
            last_wrote: today,
        }
    }

    /// Deserializes from reader; the key width is not self-describing,
    /// so the caller supplies it.
    ///
    /// # Errors
    ///
    /// Fails on I/O error (including a short read).
    pub fn decode_from<R: Read>(reader: &mut R, key_len: usize) -> Result<Self, DecodeError> {
        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;

        let chunk_size = reader.read_u16::<BigEndian>()?;
        let chunk_count = reader.read_u32::<BigEndian>()?;
        let cluster_idx = reader.read_u8()?;
        let flags = reader.read_u8()?;
        let index_pos = reader.read_u32::<BigEndian>()?;
        let last_read = reader.read_u16::<BigEndian>()?;
        let last_wrote = reader.read_u16::<BigEndian>()?;

        Ok(Self {
            key: key.into(),
            chunk_size,
            chunk_count,
            cluster_idx,
            flags,
            index_pos,
            last_read,
            last_wrote,
        })
    }
}

impl Encode for MetaEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.key)?;
        writer.write_u16::<BigEndian>(self.chunk_size)?;
        writer.write_u32::<BigEndian>(self.chunk_count)?;
        writer.write_u8(self.cluster_idx)?;
        writer.write_u8(self.flags)?;
        writer.write_u32::<BigEndian>(self.index_pos)?;
        writer.write_u16::<BigEndian>(self.last_read)?;
        writer.write_u16::<BigEndian>(self.last_wrote)?;
        Ok(())
    }
}
