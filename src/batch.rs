// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{meta::MetaEntry, rowset::RowSet, Slice};

/// One element of a bulk merge, tagged by whether its key is already indexed.
///
/// A single partitioning pass over the metadata store splits a batch into
/// these two variants; they are then executed in two homogeneous loops so
/// that all metadata mutations of the existing items can be flushed as one
/// block.
pub enum BatchItem {
    /// Key not indexed yet; becomes a fresh slot and metadata entry
    New {
        /// The key to index
        key: Slice,

        /// Incoming collection
        rows: RowSet,
    },

    /// Key already indexed; merges into (and possibly moves) its slot
    Existing {
        /// The indexed key
        key: Slice,

        /// Incoming collection to union with the stored one
        rows: RowSet,

        /// The key's current metadata entry
        entry: MetaEntry,
    },
}

impl BatchItem {
    /// The key this item targets.
    #[must_use]
    pub fn key(&self) -> &Slice {
        match self {
            Self::New { key, .. } | Self::Existing { key, .. } => key,
        }
    }
}
