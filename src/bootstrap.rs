// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    meta::MetaEntry,
    meta_table::MetaTable,
    naming::ArrayFileName,
    partition::PartitionSizing,
    registry::ArrayRegistry,
    rowset::RowSet,
    time,
};
use std::{
    path::Path,
    time::{Duration, Instant},
};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

const FLUSH_EVERY: usize = 8_192;

/// Rebuilds the metadata store from the array files.
///
/// Runs only when no metadata store exists at open time. Every live slot of
/// every matching array file turns into one metadata entry whose row count
/// comes from the slot's blob header. Aside from timestamps the result is a
/// pure function of the on-disk state.
pub fn run(
    folder: &Path,
    stub: &str,
    sizing: &PartitionSizing,
    registry: &mut ArrayRegistry,
    table: &mut MetaTable,
) -> crate::Result<()> {
    let mut names: Vec<ArrayFileName> = vec![];

    for dirent in std::fs::read_dir(folder)? {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        if let Some(name) = ArrayFileName::parse(stub, file_name) {
            names.push(name);
        }
    }

    // deterministic scan order, so duplicate keys across files
    // resolve the same way on every run
    names.sort_unstable();

    log::info!("rebuilding metadata store from {} array file(s)", names.len());

    let today = time::today();

    for name in names {
        if name.load_factor != sizing.load_factor() {
            log::debug!(
                "skipping array file with foreign load factor {:#04X}",
                name.load_factor,
            );
            continue;
        }

        if name.partition >= sizing.max_partitions() {
            log::warn!(
                "skipping array file of partition {} beyond the configured {}",
                name.partition,
                sizing.max_partitions(),
            );
            continue;
        }

        let array = registry.get_or_open(name.partition, name.serial, name.chunk_size)?;
        let total_slots = array.len();

        let started = Instant::now();
        let mut last_report = started;

        let mut batch: Vec<MetaEntry> = vec![];

        for item in array.scan()? {
            let (slot, record) = item?;

            let live = match RowSet::live_count_of_blob(&record.blob) {
                Ok(live) => live,
                Err(e) => {
                    log::warn!(
                        "skipping slot {slot} of partition {}: unreadable blob header ({e})",
                        name.partition,
                    );
                    continue;
                }
            };

            batch.push(MetaEntry::new(
                record.key,
                name.chunk_size,
                live,
                name.partition,
                slot,
            ));

            if batch.len() >= FLUSH_EVERY {
                table.put_multiple(std::mem::take(&mut batch), today)?;
            }

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                report_progress(name.partition, slot + 1, total_slots, started.elapsed());
            }
        }

        if !batch.is_empty() {
            table.put_multiple(batch, today)?;
        }
    }

    table.sync()?;

    log::info!("metadata store rebuilt with {} entries", table.len());

    Ok(())
}

fn report_progress(partition: u8, processed: u32, total: u32, elapsed: Duration) {
    let eta_secs = if processed == 0 {
        0
    } else {
        elapsed.as_secs() * u64::from(total - processed) / u64::from(processed)
    };

    log::info!(
        "bootstrapping partition {partition}: slot {processed}/{total}, ETA {eta_secs}s",
    );
}
