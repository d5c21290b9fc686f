// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{file::rewrite_atomic, naming, rowdef::RowDef};
use std::path::Path;

/// Checks the requested payload schema against every property file found
/// for this (stub, load factor), then persists the current descriptor.
///
/// A stored descriptor must be subsumed by the requested one: callers may
/// extend the schema by appending columns, never reorder or resize existing
/// ones. Property files of older (narrower) chunk sizes stay in place so
/// the check keeps working across extensions.
///
/// # Errors
///
/// Fails with `SchemaIncompatible` on any violating descriptor,
/// or on I/O error.
pub fn check_and_store(
    folder: &Path,
    stub: &str,
    load_factor: u8,
    rowdef: &RowDef,
) -> crate::Result<()> {
    for dirent in std::fs::read_dir(folder)? {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        let Some((lf, _chunk_size)) = naming::parse_properties_file_name(stub, file_name) else {
            continue;
        };
        if lf != load_factor {
            continue;
        }

        let text = std::fs::read_to_string(dirent.path())?;
        let Some(descriptor) = parse_rowdef_property(&text) else {
            log::warn!("property file {file_name:?} carries no rowdef, ignoring");
            continue;
        };

        let Some(stored) = RowDef::parse(&descriptor) else {
            return Err(crate::Error::SchemaIncompatible {
                stored: descriptor,
                requested: rowdef.descriptor(),
            });
        };

        if !stored.subsumed_by(rowdef) {
            return Err(crate::Error::SchemaIncompatible {
                stored: stored.descriptor(),
                requested: rowdef.descriptor(),
            });
        }
    }

    let path = folder.join(naming::properties_file_name(
        stub,
        load_factor,
        rowdef.row_width(),
    ));

    let content = format!("rowdef = {}\n", rowdef.descriptor());
    rewrite_atomic(&path, content.as_bytes())?;

    Ok(())
}

fn parse_rowdef_property(text: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "rowdef" {
                return Some(value.trim().to_owned());
            }
        }
    }
    None
}
