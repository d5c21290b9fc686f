// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    array_file::ArrayFile,
    naming::ArrayFileName,
    partition::PartitionSizing,
    rowset::BLOB_OVERHEAD,
};
use rustc_hash::FxHashMap;
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
struct ArrayKey {
    partition: u8,
    serial: u8,
    chunk_size: u16,
}

/// Lazily opens and caches [`ArrayFile`] handles.
///
/// The write path only ever touches serial 0; other serials show up during
/// bootstrap when old migration files are still lying around.
pub struct ArrayRegistry {
    arrays: FxHashMap<ArrayKey, ArrayFile>,
    folder: PathBuf,
    stub: String,
    key_len: u16,
    sizing: PartitionSizing,
    initial_slots: u32,
}

impl ArrayRegistry {
    #[must_use]
    pub fn new(
        folder: PathBuf,
        stub: String,
        key_len: u16,
        sizing: PartitionSizing,
        initial_slots: u32,
    ) -> Self {
        Self {
            arrays: FxHashMap::default(),
            folder,
            stub,
            key_len,
            sizing,
            initial_slots,
        }
    }

    /// Record blob width of a slot in `partition` for rows of `chunk_size` bytes.
    #[must_use]
    pub fn blob_len(&self, partition: u8, chunk_size: u16) -> u32 {
        BLOB_OVERHEAD + self.sizing.slot_capacity(partition) * u32::from(chunk_size)
    }

    /// Returns the cached handle or opens (creating if needed) the array file.
    ///
    /// # Errors
    ///
    /// Fails on I/O error or a file/record-shape mismatch.
    pub fn get_or_open(
        &mut self,
        partition: u8,
        serial: u8,
        chunk_size: u16,
    ) -> crate::Result<&mut ArrayFile> {
        let key = ArrayKey {
            partition,
            serial,
            chunk_size,
        };

        if !self.arrays.contains_key(&key) {
            let name = ArrayFileName {
                load_factor: self.sizing.load_factor(),
                chunk_size,
                partition,
                serial,
            };
            let path = self.folder.join(name.format(&self.stub));

            log::debug!("opening array file {path:?}");

            let array = ArrayFile::open(
                &path,
                self.key_len,
                self.blob_len(partition, chunk_size),
                self.initial_slots,
            )?;

            self.arrays.insert(key, array);
        }

        // NOTE: Just inserted above
        #[allow(clippy::expect_used)]
        Ok(self.arrays.get_mut(&key).expect("handle was just opened"))
    }

    /// Syncs and releases every cached handle exactly once.
    ///
    /// # Errors
    ///
    /// Fails on I/O error; remaining handles are still dropped.
    pub fn close_all(&mut self) -> crate::Result<()> {
        let mut result = Ok(());

        for (_, mut array) in self.arrays.drain() {
            if let Err(e) = array.sync() {
                log::error!("failed to sync array file {:?}: {e}", array.path());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }
}
