// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// File extension of array files.
pub const ARRAY_FILE_EXT: &str = "kca";

/// File extension of property files.
pub const PROPERTIES_FILE_EXT: &str = "properties";

/// Identity of one array file, as encoded in its file name.
///
/// The on-disk shape is `<stub>.<LF>.<CS>.<PN>.<SN>.kca` where the four
/// fields are zero-padded uppercase hex of widths 2, 4, 2 and 2:
/// load factor, chunk size, partition and serial.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ArrayFileName {
    /// Geometric growth ratio the file was written under
    pub load_factor: u8,

    /// Payload row width in bytes at time of write
    pub chunk_size: u16,

    /// Partition number (decides the slot capacity)
    pub partition: u8,

    /// Migration serial; the write path only ever produces 0
    pub serial: u8,
}

impl ArrayFileName {
    /// Renders the file name for `stub`.
    #[must_use]
    pub fn format(&self, stub: &str) -> String {
        format!(
            "{stub}.{:02X}.{:04X}.{:02X}.{:02X}.{ARRAY_FILE_EXT}",
            self.load_factor, self.chunk_size, self.partition, self.serial,
        )
    }

    /// Parses a directory entry name.
    ///
    /// Only the exact shape above is accepted; anything else (including
    /// lowercase hex or wrong field widths) returns `None` so foreign files
    /// in the directory are ignored.
    #[must_use]
    pub fn parse(stub: &str, file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(stub)?.strip_prefix('.')?;
        let rest = rest.strip_suffix(ARRAY_FILE_EXT)?.strip_suffix('.')?;

        let mut fields = rest.split('.');
        let load_factor = hex_field(fields.next()?, 2)?;
        let chunk_size = hex_field(fields.next()?, 4)?;
        let partition = hex_field(fields.next()?, 2)?;
        let serial = hex_field(fields.next()?, 2)?;

        if fields.next().is_some() {
            return None;
        }

        Some(Self {
            load_factor: u8::try_from(load_factor).ok()?,
            chunk_size: u16::try_from(chunk_size).ok()?,
            partition: u8::try_from(partition).ok()?,
            serial: u8::try_from(serial).ok()?,
        })
    }
}

/// Renders the property file name for a (stub, load factor, chunk size) triple.
#[must_use]
pub fn properties_file_name(stub: &str, load_factor: u8, chunk_size: u16) -> String {
    format!("{stub}.{load_factor:02X}.{chunk_size:04X}.{PROPERTIES_FILE_EXT}")
}

/// Parses a property file name, returning its (load factor, chunk size).
#[must_use]
pub fn parse_properties_file_name(stub: &str, file_name: &str) -> Option<(u8, u16)> {
    let rest = file_name.strip_prefix(stub)?.strip_prefix('.')?;
    let rest = rest.strip_suffix(PROPERTIES_FILE_EXT)?.strip_suffix('.')?;

    let mut fields = rest.split('.');
    let load_factor = hex_field(fields.next()?, 2)?;
    let chunk_size = hex_field(fields.next()?, 4)?;

    if fields.next().is_some() {
        return None;
    }

    Some((
        u8::try_from(load_factor).ok()?,
        u16::try_from(chunk_size).ok()?,
    ))
}

fn hex_field(s: &str, width: usize) -> Option<u32> {
    if s.len() != width {
        return None;
    }
    if !s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}
