// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    batch::BatchItem,
    bootstrap,
    config::Config,
    file::fsync_directory,
    key_policy::SharedKeyPolicy,
    meta::MetaEntry,
    meta_table::MetaTable,
    partition::PartitionSizing,
    properties,
    registry::ArrayRegistry,
    rowdef::RowDef,
    rowset::RowSet,
    time, Slice,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// A persistent map from fixed-width keys to row collections.
///
/// Collections live in capacity-tiered array files; a small metadata store
/// points each key at its current slot. All operations are serialized under
/// one instance-wide lock; concurrent callers simply queue.
///
/// If the metadata store is missing at open time (first start, or deleted
/// after a crash), it is rebuilt by scanning the array files.
pub struct CollectionIndex {
    inner: Mutex<Inner>,
}

struct Inner {
    rowdef: Arc<RowDef>,
    sizing: PartitionSizing,
    policy: SharedKeyPolicy,
    key_len: u16,
    registry: ArrayRegistry,
    table: MetaTable,
    closed: bool,
}

impl CollectionIndex {
    /// Opens an index; use [`Config::open`].
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the stored payload
    /// schema is incompatible with the requested one.
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        properties::check_and_store(
            &config.path,
            &config.stub,
            config.load_factor,
            &config.row_def,
        )?;

        let sizing = PartitionSizing::new(config.load_factor, config.max_partitions);

        let mut registry = ArrayRegistry::new(
            config.path.clone(),
            config.stub.clone(),
            config.key_len,
            sizing,
            config.initial_slots,
        );

        let table_path = config.path.join(format!("{}.index", config.stub));

        let table = if table_path.exists() {
            MetaTable::open(&table_path, config.key_len)?
        } else {
            let mut table = MetaTable::create(&table_path, config.key_len)?;
            bootstrap::run(
                &config.path,
                &config.stub,
                &sizing,
                &mut registry,
                &mut table,
            )?;
            table
        };

        fsync_directory(&config.path)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                rowdef: Arc::new(config.row_def),
                sizing,
                policy: config.key_policy,
                key_len: config.key_len,
                registry,
                table,
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // NOTE: Nothing sane to do after a poisoned lock
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock is poisoned")
    }

    /// The payload row schema.
    #[must_use]
    pub fn row_def(&self) -> Arc<RowDef> {
        self.lock().rowdef.clone()
    }

    /// Overwrites the collection stored under `key`.
    ///
    /// Storing an empty collection deletes the key entirely.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, if the collection does not
    /// fit the highest partition, or if the index was closed.
    ///
    /// # Panics
    ///
    /// Panics if key or row width do not match the configuration.
    pub fn put(&self, key: &[u8], rows: &RowSet) -> crate::Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.check_widths(key, Some(rows));

        match (inner.table.get(key), rows.is_empty()) {
            (None, true) => Ok(()),
            (None, false) => inner.insert_new(key, rows),
            (Some(entry), true) => inner.drop_entry(&entry),
            (Some(entry), false) => inner.replace_or_transit(entry, key, rows),
        }
    }

    /// Unions `rows` into the collection stored under `key`.
    ///
    /// An absent key behaves like a plain insert. Merging an empty
    /// collection changes nothing.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, if the union does not fit
    /// the highest partition, or if the index was closed.
    ///
    /// # Panics
    ///
    /// Panics if key or row width do not match the configuration.
    pub fn merge(&self, key: &[u8], rows: &RowSet) -> crate::Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.check_widths(key, Some(rows));

        if rows.is_empty() {
            return Ok(());
        }

        let stored = inner.read_repair(key, false)?;

        // the read may have healed the entry away, so look again
        match inner.table.get(key) {
            None => inner.insert_new(key, rows),
            Some(entry) => {
                let mut merged = stored.unwrap_or_else(|| RowSet::new(inner.rowdef.clone()));
                merged.merge(rows);
                inner.replace_or_transit(entry, key, &merged)
            }
        }
    }

    /// Merges a whole batch, amortizing metadata I/O.
    ///
    /// The batch is split into fresh and already-indexed keys by one lookup
    /// per input. Fresh keys are inserted immediately; for the rest, all
    /// array writes happen first and their metadata entries are committed
    /// as one block at the end. A crash mid-batch loses at most metadata
    /// that the next bootstrap reconstructs from the array files.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, if a union does not fit the
    /// highest partition, or if the index was closed.
    ///
    /// # Panics
    ///
    /// Panics if a key or row width does not match the configuration.
    pub fn merge_multiple<I>(&self, containers: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = (Slice, RowSet)>,
    {
        let mut inner = self.lock();
        inner.ensure_open()?;

        let mut items = vec![];

        for (key, rows) in containers {
            inner.check_widths(&key, Some(&rows));

            if rows.is_empty() {
                continue;
            }

            match inner.table.get(&key) {
                None => items.push(BatchItem::New { key, rows }),
                Some(entry) => items.push(BatchItem::Existing { key, rows, entry }),
            }
        }

        let mut existing = vec![];

        for item in items {
            match item {
                BatchItem::New { key, rows } => inner.insert_new(&key, &rows)?,
                BatchItem::Existing { .. } => existing.push(item),
            }
        }

        let mut buffered = Vec::with_capacity(existing.len());

        for item in existing {
            let BatchItem::Existing { key, rows, entry } = item else {
                unreachable!("new items were drained above");
            };
            buffered.push(inner.merge_buffered(&key, rows, entry)?);
        }

        if !buffered.is_empty() {
            inner.table.put_multiple(buffered, time::today())?;
        }

        Ok(())
    }

    /// Removes rows by their row key (first payload column) from the
    /// collection under `key`, returning how many rows went away.
    ///
    /// Row keys shorter than the first column are zero-padded, so textual
    /// names and raw byte strings address the same rows. Removing the last
    /// row deletes the key entirely.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the index was closed.
    ///
    /// # Panics
    ///
    /// Panics if the key width does not match the configuration.
    pub fn remove<K: AsRef<[u8]>>(&self, key: &[u8], row_keys: &[K]) -> crate::Result<u32> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.check_widths(key, None);

        let Some(mut rows) = inner.read_repair(key, false)? else {
            return Ok(0);
        };

        let removed = rows.remove_row_keys(row_keys);
        if removed == 0 {
            return Ok(0);
        }

        let Some(entry) = inner.table.get(key) else {
            return Ok(removed);
        };

        if rows.is_empty() {
            inner.drop_entry(&entry)?;
        } else {
            inner.replace_or_transit(entry, key, &rows)?;
        }

        Ok(removed)
    }

    /// Returns the collection stored under `key`.
    ///
    /// Runs through the read-and-repair path: locally diagnosable
    /// inconsistencies between metadata and slot are fixed and logged on
    /// the way.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, if the backing slot is
    /// gone entirely, or if the index was closed.
    ///
    /// # Panics
    ///
    /// Panics if the key width does not match the configuration.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<RowSet>> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.check_widths(key, None);

        inner.read_repair(key, false)
    }

    /// Returns the collection stored under `key` and deletes it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, if the backing slot is
    /// gone entirely, or if the index was closed.
    ///
    /// # Panics
    ///
    /// Panics if the key width does not match the configuration.
    pub fn delete(&self, key: &[u8]) -> crate::Result<Option<RowSet>> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.check_widths(key, None);

        let rows = inner.read_repair(key, true)?;

        if rows.is_some() {
            inner.table.remove(key)?;
        }

        Ok(rows)
    }

    /// Number of indexed keys.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index was closed.
    pub fn len(&self) -> crate::Result<usize> {
        let inner = self.lock();
        inner.ensure_open()?;
        Ok(inner.table.len())
    }

    /// Returns `true` if no key is indexed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index was closed.
    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether `key` is indexed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index was closed.
    pub fn contains_key(&self, key: &[u8]) -> crate::Result<bool> {
        let inner = self.lock();
        inner.ensure_open()?;
        Ok(inner.table.contains(key))
    }

    /// Stored row count of `key`'s collection, without loading it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index was closed.
    pub fn row_count(&self, key: &[u8]) -> crate::Result<Option<u32>> {
        let inner = self.lock();
        inner.ensure_open()?;
        Ok(inner.table.get(key).map(|e| e.chunk_count))
    }

    /// Returns the raw metadata entry for `key`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index was closed.
    #[doc(hidden)]
    pub fn meta_entry(&self, key: &[u8]) -> crate::Result<Option<MetaEntry>> {
        let inner = self.lock();
        inner.ensure_open()?;
        Ok(inner.table.get(key))
    }

    /// Upper bound on the working-set bytes needed to sort the largest
    /// possible collection.
    #[must_use]
    pub fn min_memory(&self) -> u64 {
        let inner = self.lock();
        2 * u64::from(inner.sizing.largest_slot_capacity()) * u64::from(inner.rowdef.row_width())
    }

    /// Iterates over `(key, collection)` pairs in key order, starting at
    /// `start_key` (or the smallest key).
    ///
    /// With `rotate`, reaching the end wraps around to the smallest key and
    /// continues until the iteration would revisit its starting point.
    ///
    /// Each step performs one metadata read and one read-and-repair.
    /// Mutating the index between steps may invalidate the iterator;
    /// iterating past a concurrent write on the same key is undefined.
    #[must_use]
    pub fn key_collections(&self, start_key: Option<&[u8]>, rotate: bool) -> KeyCollections<'_> {
        KeyCollections {
            index: self,
            start: start_key.map(Slice::new),
            cursor: None,
            rotate,
            primed: false,
            wrapped: false,
            done: false,
        }
    }

    /// Closes the index.
    ///
    /// The metadata store is compacted and closed first, then every cached
    /// array file is released exactly once. Any call after this fails with
    /// `Closed`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the index was already
    /// closed.
    pub fn close(&self) -> crate::Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;

        inner.table.close()?;
        inner.registry.close_all()?;
        inner.closed = true;

        Ok(())
    }
}

impl Inner {
    fn ensure_open(&self) -> crate::Result<()> {
        if self.closed {
            Err(crate::Error::Closed)
        } else {
            Ok(())
        }
    }

    fn check_widths(&self, key: &[u8], rows: Option<&RowSet>) {
        assert_eq!(
            usize::from(self.key_len),
            key.len(),
            "key width does not match configuration",
        );

        if let Some(rows) = rows {
            assert_eq!(
                self.rowdef.row_width(),
                rows.rowdef().row_width(),
                "row width does not match configuration",
            );
        }
    }

    fn insert_new(&mut self, key: &[u8], rows: &RowSet) -> crate::Result<()> {
        let partition = self.sizing.partition_for(rows.len())?;
        let chunk_size = self.rowdef.row_width();

        let blob = rows.export(self.sizing.slot_capacity(partition))?;
        let array = self.registry.get_or_open(partition, 0, chunk_size)?;
        let slot = array.add(key, &blob)?;

        self.table.add_unique(MetaEntry::new(
            Slice::new(key),
            chunk_size,
            rows.len(),
            partition,
            slot,
        ))
    }

    fn drop_entry(&mut self, entry: &MetaEntry) -> crate::Result<()> {
        let array = self
            .registry
            .get_or_open(entry.cluster_idx, 0, entry.chunk_size)?;
        array.remove(entry.index_pos)?;

        self.table.remove(&entry.key)?;
        Ok(())
    }

    /// Rewrites `key`'s collection, in place if it still fits its slot,
    /// otherwise into the partition (and row width) that fits now.
    ///
    /// Does not write the metadata store; returns the updated entry.
    fn write_rows(
        &mut self,
        key: &[u8],
        rows: &RowSet,
        mut entry: MetaEntry,
        reuse_slot: bool,
    ) -> crate::Result<MetaEntry> {
        let needed = self.sizing.partition_for(rows.len())?;
        let chunk_size = self.rowdef.row_width();

        // A shrunken collection stays in its (now oversized) slot; only
        // growth past the slot capacity, or a row width change, transits.
        if reuse_slot && chunk_size == entry.chunk_size && needed <= entry.cluster_idx {
            let blob = rows.export(self.sizing.slot_capacity(entry.cluster_idx))?;
            let array = self
                .registry
                .get_or_open(entry.cluster_idx, 0, chunk_size)?;
            array.set(entry.index_pos, key, &blob)?;
        } else {
            if reuse_slot {
                let old = self
                    .registry
                    .get_or_open(entry.cluster_idx, 0, entry.chunk_size)?;
                old.remove(entry.index_pos)?;
            }

            let blob = rows.export(self.sizing.slot_capacity(needed))?;
            let array = self.registry.get_or_open(needed, 0, chunk_size)?;
            let slot = array.add(key, &blob)?;

            entry.chunk_size = chunk_size;
            entry.cluster_idx = needed;
            entry.index_pos = slot;
        }

        entry.chunk_count = rows.len();
        entry.last_wrote = time::today();

        Ok(entry)
    }

    fn replace_or_transit(
        &mut self,
        entry: MetaEntry,
        key: &[u8],
        rows: &RowSet,
    ) -> crate::Result<()> {
        let updated = self.write_rows(key, rows, entry, true)?;
        self.table.put(updated)
    }

    /// Per-item half of a bulk merge: all array writes happen here, the
    /// metadata mutation is only returned, to be committed with the batch.
    fn merge_buffered(
        &mut self,
        key: &[u8],
        incoming: RowSet,
        entry: MetaEntry,
    ) -> crate::Result<MetaEntry> {
        let array = self
            .registry
            .get_or_open(entry.cluster_idx, 0, entry.chunk_size)?;

        let Some(record) = array.get(entry.index_pos)? else {
            return Err(crate::Error::Corruption(format!(
                "metadata for key {key:?} points at missing slot {} of partition {}",
                entry.index_pos, entry.cluster_idx,
            )));
        };

        let mut merged = incoming;
        let mut slot_is_ours = true;

        if record.key.as_ref() == key {
            let stored = RowSet::from_blob(&record.blob, self.rowdef.clone())?;
            merged.merge(&stored);
        } else if self.policy.is_wellformed(&record.key) {
            // foreign slot: leave it alone and move this key elsewhere
            log::error!(
                "slot {} of partition {} holds key {:?}, expected {key:?}",
                entry.index_pos,
                entry.cluster_idx,
                &*record.key,
            );
            slot_is_ours = false;
        } else {
            log::warn!(
                "reclaiming slot {} of partition {}: malformed key",
                entry.index_pos,
                entry.cluster_idx,
            );
            let array = self
                .registry
                .get_or_open(entry.cluster_idx, 0, entry.chunk_size)?;
            array.remove(entry.index_pos)?;
            slot_is_ours = false;
        }

        self.write_rows(key, &merged, entry, slot_is_ours)
    }

    /// The common read path of `get`, `delete`, iteration and `merge`.
    ///
    /// Returns the collection, or `None` if the key is absent (possibly
    /// because the read just healed its entry away). Every inconsistency
    /// that can be diagnosed locally is repaired and logged; only a fully
    /// missing slot is surfaced, as corruption beyond this layer's remit.
    fn read_repair(&mut self, key: &[u8], delete_slot: bool) -> crate::Result<Option<RowSet>> {
        let Some(mut entry) = self.table.get(key) else {
            return Ok(None);
        };

        let array = self
            .registry
            .get_or_open(entry.cluster_idx, 0, entry.chunk_size)?;

        let Some(record) = array.get(entry.index_pos)? else {
            return Err(crate::Error::Corruption(format!(
                "metadata for key {key:?} points at missing slot {} of partition {}",
                entry.index_pos, entry.cluster_idx,
            )));
        };

        if !self.policy.is_wellformed(&record.key) {
            // the slot is garbage; neither side can be saved
            log::warn!(
                "dropping slot {} of partition {} and key {key:?}: malformed slot key",
                entry.index_pos,
                entry.cluster_idx,
            );

            let array = self
                .registry
                .get_or_open(entry.cluster_idx, 0, entry.chunk_size)?;
            array.remove(entry.index_pos)?;
            self.table.remove(key)?;

            return Ok(Some(RowSet::new(self.rowdef.clone())));
        }

        if record.key.as_ref() != key {
            // the slot belongs to another key; believe the slot, forget
            // the requested key's entry
            log::error!(
                "slot {} of partition {} holds key {:?}, expected {key:?}; re-pointing",
                entry.index_pos,
                entry.cluster_idx,
                &*record.key,
            );

            self.table.remove(key)?;

            let live = RowSet::live_count_of_blob(&record.blob).unwrap_or(0);
            self.table.put(MetaEntry::new(
                record.key.clone(),
                entry.chunk_size,
                live,
                entry.cluster_idx,
                entry.index_pos,
            ))?;

            return Ok(None);
        }

        let rows = RowSet::from_blob(&record.blob, self.rowdef.clone())?;

        if rows.len() != entry.chunk_count {
            log::warn!(
                "correcting stored row count for key {key:?}: {} -> {}",
                entry.chunk_count,
                rows.len(),
            );
            entry.chunk_count = rows.len();
            self.table.put(entry.clone())?;
        }

        if delete_slot {
            let array = self
                .registry
                .get_or_open(entry.cluster_idx, 0, entry.chunk_size)?;
            array.remove(entry.index_pos)?;
        } else if entry.last_read != time::today() {
            entry.last_read = time::today();
            self.table.put(entry)?;
        }

        Ok(Some(rows))
    }
}

/// Lazy iterator over `(key, collection)` pairs in key order.
///
/// Created by [`CollectionIndex::key_collections`].
pub struct KeyCollections<'a> {
    index: &'a CollectionIndex,
    start: Option<Slice>,
    cursor: Option<Slice>,
    rotate: bool,
    primed: bool,
    wrapped: bool,
    done: bool,
}

impl Iterator for KeyCollections<'_> {
    type Item = crate::Result<(Slice, RowSet)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut inner = self.index.lock();

        if inner.closed {
            self.done = true;
            return Some(Err(crate::Error::Closed));
        }

        loop {
            let candidate = if self.primed {
                match &self.cursor {
                    Some(k) => match inner.table.after(k) {
                        Some(e) => Some(e),
                        None if self.rotate && !self.wrapped => {
                            self.wrapped = true;
                            inner.table.first()
                        }
                        None => None,
                    },
                    None => None,
                }
            } else {
                self.primed = true;

                let first = match &self.start {
                    Some(s) => inner.table.at_or_after(s),
                    None => inner.table.first(),
                };

                let first = match first {
                    Some(e) => Some(e),
                    None if self.rotate && self.start.is_some() => {
                        self.wrapped = true;
                        inner.table.first()
                    }
                    None => None,
                };

                // remember where we started so rotation knows when to stop
                if self.start.is_none() {
                    self.start = first.as_ref().map(|e| e.key.clone());
                }

                first
            };

            let Some(entry) = candidate else {
                self.done = true;
                return None;
            };

            if self.wrapped {
                if let Some(start) = &self.start {
                    if entry.key >= *start {
                        self.done = true;
                        return None;
                    }
                }
            }

            self.cursor = Some(entry.key.clone());

            match inner.read_repair(&entry.key, false) {
                Ok(Some(rows)) => return Some(Ok((entry.key, rows))),
                // healed away under us; skip to the next key
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowdef::ColumnDef;
    use test_log::test;

    fn config(path: &std::path::Path) -> Config {
        Config::new(
            path,
            4,
            RowDef::new(vec![ColumnDef::new("key", 3), ColumnDef::new("value", 2)]),
        )
    }

    #[test]
    fn closed_index_refuses_everything() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let index = config(dir.path()).open()?;

        index.close()?;

        assert!(matches!(index.len(), Err(crate::Error::Closed)));
        assert!(matches!(index.get(b"aaaa"), Err(crate::Error::Closed)));
        assert!(matches!(index.close(), Err(crate::Error::Closed)));

        let mut iter = index.key_collections(None, false);
        assert!(matches!(iter.next(), Some(Err(crate::Error::Closed))));

        Ok(())
    }

    #[test]
    fn min_memory_bound() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let index = config(dir.path()).open()?;

        // 2 * 4^9 * 5
        assert_eq!(2 * 262_144 * 5, index.min_memory());

        Ok(())
    }
}
