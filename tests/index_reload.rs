use collection_index::{ColumnDef, Config, PartitionSizing, RowDef, RowSet};
use std::io::Write;
use test_log::test;

const KEY_LEN: u16 = 9;

fn schema() -> RowDef {
    RowDef::new(vec![
        ColumnDef::new("word", 10),
        ColumnDef::new("posting", 80),
    ])
}

fn config(path: &std::path::Path) -> Config {
    Config::new(path, KEY_LEN, schema())
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

fn row(row_key: &[u8]) -> Vec<u8> {
    let mut row = vec![0u8; 90];
    row[..row_key.len()].copy_from_slice(row_key);
    row
}

fn rows(n: usize, tag: &str) -> RowSet {
    let mut set = RowSet::new(schema());
    for i in 0..n {
        set.insert(&row(format!("{tag}{i:06}").as_bytes()));
    }
    set
}

#[test]
fn reload_smoke_test() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let index = config(folder.path()).open()?;
        index.put(&key(1), &rows(3, "a"))?;
        index.close()?;
    }

    {
        let index = config(folder.path()).open()?;
        assert_eq!(1, index.len()?);
        assert_eq!(rows(3, "a"), index.get(&key(1))?.unwrap());
    }

    Ok(())
}

#[test]
fn reload_empty() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let index = config(folder.path()).open()?;
        assert_eq!(0, index.len()?);
        index.close()?;
    }

    {
        let index = config(folder.path()).open()?;
        assert_eq!(0, index.len()?);
    }

    Ok(())
}

#[test]
fn bootstrap_reconstructs_metadata() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut expected = vec![];

    {
        let index = config(folder.path()).open()?;
        for i in 1..=17 {
            index.put(&key(i), &rows(i, "r"))?;
        }
        for i in 1..=17 {
            expected.push((key(i), index.get(&key(i))?.unwrap()));
        }
        index.close()?;
    }

    std::fs::remove_file(folder.path().join("index.index"))?;

    let index = config(folder.path()).open()?;
    assert_eq!(17, index.len()?);

    let sizing = PartitionSizing::new(4, 9);

    for (k, set) in &expected {
        assert_eq!(*set, index.get(k)?.unwrap(), "key {k:?}");

        let entry = index.meta_entry(k)?.unwrap();
        assert_eq!(set.len(), entry.chunk_count);
        assert!(entry.cluster_idx >= sizing.partition_for(entry.chunk_count)?);
    }

    Ok(())
}

#[test]
fn bootstrap_is_idempotent() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let index = config(folder.path()).open()?;
        for i in 1..=10 {
            index.put(&key(i), &rows(i, "r"))?;
        }
        index.close()?;
    }

    type Entries = Vec<(collection_index::Slice, u32, u8, u32)>;

    let collect = |index: &collection_index::CollectionIndex| -> collection_index::Result<Entries> {
        let mut entries = vec![];
        for i in 1..=10 {
            let e = index.meta_entry(&key(i))?.unwrap();
            entries.push((e.key, e.chunk_count, e.cluster_idx, e.index_pos));
        }
        Ok(entries)
    };

    std::fs::remove_file(folder.path().join("index.index"))?;
    let first = {
        let index = config(folder.path()).open()?;
        let entries = collect(&index)?;
        index.close()?;
        entries
    };

    std::fs::remove_file(folder.path().join("index.index"))?;
    let second = {
        let index = config(folder.path()).open()?;
        let entries = collect(&index)?;
        index.close()?;
        entries
    };

    assert_eq!(first, second);

    Ok(())
}

#[test]
fn reopen_with_metadata_store_skips_bootstrap() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let index = config(folder.path()).open()?;
        index.put(&key(1), &rows(2, "a"))?;
        index.close()?;
    }

    // hand-craft an orphan record, as a crash between array write and
    // metadata write would leave behind
    {
        let mut orphan = b"orphan   ".to_vec();
        orphan.extend_from_slice(&1u32.to_be_bytes());
        orphan.extend_from_slice(&90u16.to_be_bytes());
        orphan.extend_from_slice(&0u16.to_be_bytes());
        orphan.extend_from_slice(&row(b"zzz"));
        orphan.resize(9 + 368, 0);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(folder.path().join("index.04.005A.00.00.kca"))?;
        file.write_all(&orphan)?;
    }

    // with the metadata store present, the orphan stays invisible
    {
        let index = config(folder.path()).open()?;
        assert_eq!(1, index.len()?);
        assert!(!index.contains_key(b"orphan   ")?);
        index.close()?;
    }

    // without it, bootstrap reclaims the orphan as a live entry
    std::fs::remove_file(folder.path().join("index.index"))?;

    let index = config(folder.path()).open()?;
    assert_eq!(2, index.len()?);
    assert_eq!(Some(1), index.row_count(b"orphan   ")?);

    let stored = index.get(b"orphan   ")?.unwrap();
    assert!(stored.contains_row_key(b"zzz"));

    Ok(())
}

#[test]
fn bootstrap_survives_deleted_slots() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let index = config(folder.path()).open()?;
        for i in 1..=6 {
            index.put(&key(i), &rows(2, "a"))?;
        }
        index.delete(&key(2))?;
        index.delete(&key(5))?;
        index.close()?;
    }

    std::fs::remove_file(folder.path().join("index.index"))?;

    let index = config(folder.path()).open()?;
    assert_eq!(4, index.len()?);
    assert!(!index.contains_key(&key(2))?);
    assert!(!index.contains_key(&key(5))?);
    assert!(index.contains_key(&key(6))?);

    Ok(())
}
