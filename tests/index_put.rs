use collection_index::{ColumnDef, Config, RowDef, RowSet};
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
fn put_single_row() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    let mut posting = row(b"abc");
    posting[10..13].copy_from_slice(b"efg");

    let mut set = RowSet::new(schema());
    set.insert(&posting);

    index.put(b"erstes   ", &set)?;

    assert_eq!(1, index.len()?);
    assert_eq!(Some(1), index.row_count(b"erstes   ")?);

    let entry = index.meta_entry(b"erstes   ")?.unwrap();
    assert_eq!(0, entry.cluster_idx);
    assert_eq!(90, entry.chunk_size);
    assert_eq!(1, entry.chunk_count);

    // partition 0 of 90-byte rows under the default load factor
    assert!(folder.path().join("index.04.005A.00.00.kca").exists());

    let stored = index.get(b"erstes   ")?.unwrap();
    assert_eq!(set, stored);

    Ok(())
}

#[test]
fn put_partition_ladder() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    for i in 0..=17 {
        index.put(&key(i), &rows(i, "r"))?;
    }

    // an empty collection indexes nothing
    assert!(!index.contains_key(&key(0))?);
    assert_eq!(17, index.len()?);

    for i in 1..=17 {
        let entry = index.meta_entry(&key(i))?.unwrap();

        let expected = match i {
            1..=4 => 0,
            5..=16 => 1,
            _ => 2,
        };

        assert_eq!(expected, entry.cluster_idx, "key {i}");
        assert_eq!(u32::try_from(i).unwrap(), entry.chunk_count);
    }

    Ok(())
}

#[test]
fn put_empty_deletes() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.put(&key(1), &rows(3, "r"))?;
    assert!(index.contains_key(&key(1))?);

    index.put(&key(1), &rows(0, "r"))?;

    assert!(!index.contains_key(&key(1))?);
    assert_eq!(0, index.len()?);
    assert!(index.get(&key(1))?.is_none());

    Ok(())
}

#[test]
fn put_shrink_replaces_in_place() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.put(&key(1), &rows(5, "r"))?;

    let before = index.meta_entry(&key(1))?.unwrap();
    assert_eq!(1, before.cluster_idx);

    let smaller = rows(2, "s");
    index.put(&key(1), &smaller)?;

    let after = index.meta_entry(&key(1))?.unwrap();
    assert_eq!(before.cluster_idx, after.cluster_idx);
    assert_eq!(before.index_pos, after.index_pos);
    assert_eq!(2, after.chunk_count);

    assert_eq!(smaller, index.get(&key(1))?.unwrap());

    Ok(())
}

#[test]
fn put_growth_transits() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.put(&key(1), &rows(3, "r"))?;
    assert_eq!(0, index.meta_entry(&key(1))?.unwrap().cluster_idx);

    let bigger = rows(20, "s");
    index.put(&key(1), &bigger)?;

    let entry = index.meta_entry(&key(1))?.unwrap();
    assert_eq!(2, entry.cluster_idx);
    assert_eq!(20, entry.chunk_count);

    assert_eq!(bigger, index.get(&key(1))?.unwrap());

    Ok(())
}

#[test]
fn put_roundtrip_is_noop() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.put(&key(1), &rows(7, "r"))?;

    let first = index.get(&key(1))?.unwrap();
    let entry = index.meta_entry(&key(1))?.unwrap();

    index.put(&key(1), &first)?;

    let second = index.get(&key(1))?.unwrap();
    let entry_after = index.meta_entry(&key(1))?.unwrap();

    assert_eq!(first, second);
    assert_eq!(entry.cluster_idx, entry_after.cluster_idx);
    assert_eq!(entry.index_pos, entry_after.index_pos);
    assert_eq!(entry.chunk_count, entry_after.chunk_count);

    Ok(())
}

#[test]
fn put_beyond_capacity_fails() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).max_partitions(1).open()?;

    index.put(&key(1), &rows(4, "r"))?;

    assert!(matches!(
        index.put(&key(2), &rows(5, "r")),
        Err(collection_index::Error::CapacityExceeded { .. }),
    ));

    // the failed put stored nothing
    assert!(!index.contains_key(&key(2))?);
    assert_eq!(1, index.len()?);

    Ok(())
}
