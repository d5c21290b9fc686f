// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    index::CollectionIndex,
    key_policy::{AnyKey, SharedKeyPolicy},
    rowdef::RowDef,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Clone)]
/// Index configuration builder
pub struct Config {
    /// Folder path
    #[doc(hidden)]
    pub path: PathBuf,

    /// File name stem shared by all files of this index
    pub stub: String,

    /// Key width in bytes
    pub key_len: u16,

    /// Payload row schema
    pub row_def: RowDef,

    /// Geometric growth ratio between successive partitions
    pub load_factor: u8,

    /// Number of partitions; collections beyond the largest fail
    pub max_partitions: u8,

    /// Array file preallocation hint, in slots
    pub initial_slots: u32,

    /// Key well-formedness policy used by the read path
    #[doc(hidden)]
    pub key_policy: SharedKeyPolicy,
}

impl Config {
    /// Initializes a new config.
    ///
    /// # Panics
    ///
    /// Panics if `key_len` is zero.
    pub fn new<P: AsRef<Path>>(path: P, key_len: u16, row_def: RowDef) -> Self {
        assert!(key_len > 0, "key width must not be zero");

        Self {
            path: path.as_ref().into(),
            stub: "index".into(),
            key_len,
            row_def,
            load_factor: 4,
            max_partitions: 9,
            initial_slots: 0,
            key_policy: Arc::new(AnyKey),
        }
    }

    /// Sets the file name stem.
    ///
    /// Defaults to `index`.
    #[must_use]
    pub fn stub(mut self, stub: &str) -> Self {
        self.stub = stub.into();
        self
    }

    /// Sets the load factor.
    ///
    /// Defaults to 4.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn load_factor(mut self, n: u8) -> Self {
        assert!(n >= 2, "load factor must be at least 2");

        self.load_factor = n;
        self
    }

    /// Sets the number of partitions.
    ///
    /// Defaults to 9. With the default load factor of 4 the largest
    /// collection may then hold 4^9 rows.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn max_partitions(mut self, n: u8) -> Self {
        assert!(n > 0, "need at least one partition");

        self.max_partitions = n;
        self
    }

    /// Sets how many slots a freshly created array file preallocates.
    ///
    /// Defaults to 0.
    #[must_use]
    pub fn initial_slots(mut self, slots: u32) -> Self {
        self.initial_slots = slots;
        self
    }

    /// Sets the key well-formedness policy.
    ///
    /// The read path uses it to tell a repairable slot (foreign but valid
    /// key) from a lost one (garbage key). Defaults to [`AnyKey`].
    #[must_use]
    pub fn key_policy(mut self, policy: SharedKeyPolicy) -> Self {
        self.key_policy = policy;
        self
    }

    /// Opens an index using the config.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the stored payload
    /// schema is incompatible with the requested one.
    pub fn open(self) -> crate::Result<CollectionIndex> {
        CollectionIndex::open(self)
    }
}
