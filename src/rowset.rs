// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    rowdef::RowDef,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::sync::Arc;

/// Number of header bytes in front of the row area of a serialized collection.
///
/// The header makes a blob self-describing: live row count (u32),
/// row width (u16) and reserved flags (u16).
pub const BLOB_OVERHEAD: u32 = 8;

/// An ordered, deduplicated set of fixed-width payload rows.
///
/// Rows are kept sorted by their raw byte order in one contiguous buffer;
/// exact duplicate rows collapse. Membership tests and removal operate on
/// the first column (the row key).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowSet {
    rowdef: Arc<RowDef>,
    data: Vec<u8>,
}

impl RowSet {
    /// Creates an empty collection.
    #[must_use]
    pub fn new(rowdef: impl Into<Arc<RowDef>>) -> Self {
        Self {
            rowdef: rowdef.into(),
            data: Vec::new(),
        }
    }

    /// Reconstructs a collection from a serialized blob.
    ///
    /// Blobs written under an older, narrower row width are widened to the
    /// current schema by zero-padding each row (appended columns read as
    /// zero). A blob wider than the schema cannot be reinterpreted.
    ///
    /// # Errors
    ///
    /// Fails if the blob header is malformed or the row area is truncated.
    pub fn from_blob(blob: &[u8], rowdef: Arc<RowDef>) -> Result<Self, DecodeError> {
        let mut reader = blob;

        let live = reader.read_u32::<BigEndian>()?;
        let stored_width = reader.read_u16::<BigEndian>()?;
        let _flags = reader.read_u16::<BigEndian>()?;

        if stored_width == 0 {
            return Err(DecodeError::InvalidHeader("row blob"));
        }

        let need = live as usize * usize::from(stored_width);
        let rows = reader
            .get(..need)
            .ok_or(DecodeError::InvalidHeader("row blob"))?;

        let current_width = rowdef.row_width();

        let data = if stored_width == current_width {
            rows.to_vec()
        } else if stored_width < current_width {
            // widen rows written under the previous schema
            let mut data = vec![0u8; live as usize * usize::from(current_width)];
            for (src, dst) in rows
                .chunks_exact(usize::from(stored_width))
                .zip(data.chunks_exact_mut(usize::from(current_width)))
            {
                dst[..src.len()].copy_from_slice(src);
            }
            data
        } else {
            return Err(DecodeError::InvalidHeader("row blob"));
        };

        let mut set = Self { rowdef, data };
        if !set.is_normalized() {
            set.normalize();
        }
        Ok(set)
    }

    /// Reads the live row count out of a serialized blob without
    /// reconstructing the collection.
    ///
    /// # Errors
    ///
    /// Fails if the blob is shorter than its header.
    pub fn live_count_of_blob(blob: &[u8]) -> Result<u32, DecodeError> {
        let mut reader = blob;
        Ok(reader.read_u32::<BigEndian>()?)
    }

    /// Serializes into a blob sized for `capacity` rows.
    ///
    /// # Errors
    ///
    /// Fails if the collection holds more than `capacity` live rows.
    pub fn export(&self, capacity: u32) -> Result<Vec<u8>, EncodeError> {
        let live = self.len();

        if live > capacity {
            return Err(EncodeError::CapacityOverflow {
                len: live,
                capacity,
            });
        }

        let total =
            BLOB_OVERHEAD as usize + capacity as usize * usize::from(self.rowdef.row_width());

        let mut buf = Vec::with_capacity(total);
        buf.write_u32::<BigEndian>(live)?;
        buf.write_u16::<BigEndian>(self.rowdef.row_width())?;
        buf.write_u16::<BigEndian>(0)?;
        buf.extend_from_slice(&self.data);
        buf.resize(total, 0);

        Ok(buf)
    }

    /// The schema this collection's rows follow.
    #[must_use]
    pub fn rowdef(&self) -> &Arc<RowDef> {
        &self.rowdef
    }

    /// Number of live rows.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn len(&self) -> u32 {
        (self.data.len() / usize::from(self.rowdef.row_width())) as u32
    }

    /// Returns `true` if the collection holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates over the rows in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data
            .chunks_exact(usize::from(self.rowdef.row_width()))
    }

    /// Inserts a row, keeping the collection sorted.
    ///
    /// Returns `false` if an identical row was already present.
    ///
    /// # Panics
    ///
    /// Panics if the row width does not match the schema.
    pub fn insert(&mut self, row: &[u8]) -> bool {
        let width = usize::from(self.rowdef.row_width());
        assert_eq!(width, row.len(), "row width does not match schema");

        match self.search(row) {
            Ok(_) => false,
            Err(pos) => {
                self.data
                    .splice(pos * width..pos * width, row.iter().copied());
                true
            }
        }
    }

    /// Appends all rows of `other`, then sorts, deduplicates and trims.
    ///
    /// # Panics
    ///
    /// Panics if the row widths differ.
    pub fn merge(&mut self, other: &Self) {
        assert_eq!(
            self.rowdef.row_width(),
            other.rowdef.row_width(),
            "row widths do not match",
        );

        self.data.extend_from_slice(&other.data);
        self.normalize();
        self.trim();
    }

    /// Releases unused buffer capacity.
    pub fn trim(&mut self) {
        self.data.shrink_to_fit();
    }

    /// Whether any live row's first column equals `key`.
    ///
    /// Keys shorter than the first column are zero-padded at the end.
    #[must_use]
    pub fn contains_row_key(&self, key: &[u8]) -> bool {
        let key_width = usize::from(self.rowdef.row_key_width());

        let Some(key) = normalize_row_key(key, key_width) else {
            return false;
        };

        self.iter().any(|row| row[..key_width] == *key)
    }

    /// Removes every row whose first column appears in `keys`,
    /// returning the count of rows removed.
    pub fn remove_row_keys<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> u32 {
        let key_width = usize::from(self.rowdef.row_key_width());
        let width = usize::from(self.rowdef.row_width());

        let mut wanted: Vec<Vec<u8>> = keys
            .iter()
            .filter_map(|k| normalize_row_key(k.as_ref(), key_width))
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        if wanted.is_empty() {
            return 0;
        }

        let mut kept = Vec::with_capacity(self.data.len());
        let mut removed = 0u32;

        for row in self.data.chunks_exact(width) {
            let row_key = &row[..key_width];
            if wanted
                .binary_search_by(|k| k.as_slice().cmp(row_key))
                .is_ok()
            {
                removed += 1;
            } else {
                kept.extend_from_slice(row);
            }
        }

        self.data = kept;
        removed
    }

    fn row(&self, i: usize) -> &[u8] {
        let width = usize::from(self.rowdef.row_width());
        &self.data[i * width..(i + 1) * width]
    }

    fn search(&self, row: &[u8]) -> Result<usize, usize> {
        let width = usize::from(self.rowdef.row_width());
        let mut lo = 0;
        let mut hi = self.data.len() / width;

        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.row(mid).cmp(row) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Greater => hi = mid,
            }
        }

        Err(lo)
    }

    fn is_normalized(&self) -> bool {
        self.iter().zip(self.iter().skip(1)).all(|(a, b)| a < b)
    }

    fn normalize(&mut self) {
        let width = usize::from(self.rowdef.row_width());

        let mut rows: Vec<&[u8]> = self.data.chunks_exact(width).collect();
        rows.sort_unstable();
        rows.dedup();

        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            data.extend_from_slice(row);
        }

        self.data = data;
    }
}

fn normalize_row_key(key: &[u8], width: usize) -> Option<Vec<u8>> {
    if key.len() > width {
        return None;
    }
    let mut padded = vec![0u8; width];
    padded[..key.len()].copy_from_slice(key);
    Some(padded)
}
