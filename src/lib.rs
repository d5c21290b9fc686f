// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent keyed-collection index: a disk-resident map from a
//! fixed-width key to an ordered, deduplicated set of fixed-width payload
//! rows.
//!
//! ##### About
//!
//! Collections of different sizes are stored in capacity-tiered "partition"
//! files: partition `n` holds slots of exactly `L^(n+1)` rows, where `L` is
//! a small load factor (4 by default). A collection that grows past its
//! slot capacity transits into the next partition; one that shrinks may be
//! compacted back. A metadata store maps each key to its current slot.
//!
//! This layout is the storage substrate of a reverse word index
//! (word hash → posting rows), but nothing in it assumes that domain.
//!
//! Two properties do the heavy lifting:
//!
//! - Within every operation, array file writes precede metadata writes, so
//!   a crash leaves at worst an orphan slot. If the metadata store is
//!   missing at open time it is rebuilt by scanning the array files.
//! - The read path repairs any inconsistency it can diagnose locally
//!   (wrong slot key, wrong row count) and logs it; only a fully missing
//!   slot surfaces as corruption.
//!
//! # Example usage
//!
//! ```
//! use collection_index::{ColumnDef, Config, RowDef, RowSet};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! // keys are 9 bytes; payload rows are a 10-byte row key plus a 4-byte counter
//! let schema = RowDef::new(vec![ColumnDef::new("word", 10), ColumnDef::new("count", 4)]);
//!
//! let index = Config::new(folder.path(), 9, schema.clone()).open()?;
//!
//! let mut rows = RowSet::new(schema);
//! rows.insert(b"abcdefghij\x00\x00\x00\x01");
//!
//! index.put(b"erstes   ", &rows)?;
//!
//! assert_eq!(1, index.len()?);
//!
//! let stored = index.get(b"erstes   ")?.expect("was just stored");
//! assert_eq!(1, stored.len());
//!
//! // collections merge as sets
//! let mut more = RowSet::new(index.row_def());
//! more.insert(b"qrstuvwxyz\x00\x00\x00\x02");
//! index.merge(b"erstes   ", &more)?;
//!
//! assert_eq!(Some(2), index.row_count(b"erstes   ")?);
//!
//! index.close()?;
//! #
//! # Ok::<(), collection_index::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

#[doc(hidden)]
pub mod array_file;

mod batch;
mod bootstrap;

#[doc(hidden)]
pub mod coding;

mod config;
mod error;

#[doc(hidden)]
pub mod file;

mod index;
mod key_policy;
mod meta;

#[doc(hidden)]
pub mod meta_table;

mod naming;
mod partition;
mod properties;
mod registry;
mod rowdef;
mod rowset;
mod slice;
mod time;

/// The key type of the index
pub type UserKey = Slice;

#[doc(hidden)]
pub use {
    meta::MetaEntry,
    naming::ArrayFileName,
    partition::PartitionSizing,
    rowset::BLOB_OVERHEAD,
};

pub use {
    batch::BatchItem,
    coding::{DecodeError, EncodeError},
    config::Config,
    error::{Error, Result},
    index::{CollectionIndex, KeyCollections},
    key_policy::{AnyKey, AsciiKey, KeyPolicy, SharedKeyPolicy},
    rowdef::{ColumnDef, RowDef},
    rowset::RowSet,
    slice::Slice,
};
