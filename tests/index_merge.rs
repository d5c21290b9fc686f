use collection_index::{ColumnDef, Config, RowDef, RowSet, Slice};
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
fn merge_into_absent_key_inserts() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    let set = rows(3, "a");
    index.merge(&key(1), &set)?;

    assert_eq!(set, index.get(&key(1))?.unwrap());

    Ok(())
}

#[test]
fn merge_unions_without_duplicates() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.put(&key(1), &rows(3, "a"))?;

    // overlaps in one row with the stored collection
    let mut incoming = rows(2, "b");
    incoming.insert(&row(b"a000000"));

    index.merge(&key(1), &incoming)?;

    let stored = index.get(&key(1))?.unwrap();
    assert_eq!(5, stored.len());
    assert!(stored.contains_row_key(b"a000000"));
    assert!(stored.contains_row_key(b"b000001"));

    Ok(())
}

#[test]
fn merge_doubles_and_promotes() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    for i in 1..=17 {
        index.put(&key(i), &rows(i, "a"))?;
    }

    for i in 1..=17 {
        index.merge(&key(i), &rows(i, "b"))?;
    }

    for i in 1..=17 {
        let entry = index.meta_entry(&key(i))?.unwrap();
        assert_eq!(u32::try_from(2 * i).unwrap(), entry.chunk_count);

        let expected = match 2 * i {
            1..=4 => 0,
            5..=16 => 1,
            _ => 2,
        };
        assert!(
            entry.cluster_idx >= expected,
            "key {i}: partition {} below {expected}",
            entry.cluster_idx,
        );
    }

    // 3 -> 6 rows crosses the partition-0 capacity of 4
    assert_eq!(1, index.meta_entry(&key(3))?.unwrap().cluster_idx);

    Ok(())
}

#[test]
fn merge_transits_and_frees_old_slot() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.put(&key(1), &rows(1, "a"))?;
    let before = index.meta_entry(&key(1))?.unwrap();
    assert_eq!(0, before.cluster_idx);

    index.merge(&key(1), &rows(20, "b"))?;

    let after = index.meta_entry(&key(1))?.unwrap();
    assert_eq!(2, after.cluster_idx);
    assert_eq!(21, after.chunk_count);
    index.close()?;

    // the partition-0 slot was marked deleted: its key column is zeroed
    let array = std::fs::read(folder.path().join("index.04.005A.00.00.kca"))?;
    let record_offset = 16 + before.index_pos as usize * (9 + 368);
    assert!(array[record_offset..record_offset + 9].iter().all(|&b| b == 0));

    Ok(())
}

#[test]
fn merge_empty_is_noop() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.merge(&key(1), &rows(0, "a"))?;
    assert!(!index.contains_key(&key(1))?);

    index.put(&key(2), &rows(3, "a"))?;
    let entry = index.meta_entry(&key(2))?.unwrap();

    index.merge(&key(2), &rows(0, "a"))?;
    assert_eq!(entry, index.meta_entry(&key(2))?.unwrap());

    Ok(())
}

#[test]
fn merge_multiple_splits_new_and_existing() -> collection_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = config(folder.path()).open()?;

    index.put(&key(1), &rows(3, "a"))?;
    index.put(&key(2), &rows(6, "a"))?;

    index.merge_multiple(vec![
        (Slice::new(&key(1)), rows(3, "b")),
        (Slice::new(&key(3)), rows(2, "c")),
        (Slice::new(&key(4)), rows(17, "d")),
    ])?;

    assert_eq!(4, index.len()?);

    assert_eq!(Some(6), index.row_count(&key(1))?);
    assert_eq!(Some(6), index.row_count(&key(2))?);
    assert_eq!(Some(2), index.row_count(&key(3))?);
    assert_eq!(Some(17), index.row_count(&key(4))?);

    // untouched key keeps its collection
    assert_eq!(rows(6, "a"), index.get(&key(2))?.unwrap());

    // merged key is a union
    let merged = index.get(&key(1))?.unwrap();
    assert!(merged.contains_row_key(b"a000002"));
    assert!(merged.contains_row_key(b"b000002"));

    // fresh keys landed in their fitting partitions
    assert_eq!(0, index.meta_entry(&key(3))?.unwrap().cluster_idx);
    assert_eq!(2, index.meta_entry(&key(4))?.unwrap().cluster_idx);

    Ok(())
}
