// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// A single fixed-width column of a payload row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnDef {
    /// Column name; must not contain whitespace or `-`
    pub name: String,

    /// Column width in bytes
    pub width: u16,
}

impl ColumnDef {
    /// Creates a column definition.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty or contains whitespace or `-`,
    /// or if the width is zero.
    #[must_use]
    pub fn new(name: &str, width: u16) -> Self {
        assert!(!name.is_empty(), "column name must not be empty");
        assert!(
            !name.contains(['-', ' ', '\t']),
            "column name must not contain '-' or whitespace",
        );
        assert!(width > 0, "column width must not be zero");

        Self {
            name: name.into(),
            width,
        }
    }
}

/// The payload row schema: an ordered list of fixed-width columns.
///
/// Rendered to and parsed from a descriptor string of the shape
/// `name-width name-width ...`, which is what the property file stores.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowDef {
    columns: Vec<ColumnDef>,
    row_width: u16,
}

impl RowDef {
    /// Creates a schema from its columns.
    ///
    /// # Panics
    ///
    /// Panics if no column is given or the row width overflows a `u16`.
    #[must_use]
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        assert!(!columns.is_empty(), "schema needs at least one column");

        let row_width = columns
            .iter()
            .map(|c| u32::from(c.width))
            .sum::<u32>();

        #[allow(clippy::expect_used)]
        let row_width = u16::try_from(row_width).expect("row width overflows u16");

        Self { columns, row_width }
    }

    /// Parses a descriptor string.
    #[must_use]
    pub fn parse(descriptor: &str) -> Option<Self> {
        let mut columns = vec![];

        for field in descriptor.split_whitespace() {
            let (name, width) = field.rsplit_once('-')?;

            if name.is_empty() || name.contains('-') {
                return None;
            }

            let width = width.parse::<u16>().ok()?;
            if width == 0 {
                return None;
            }

            columns.push(ColumnDef {
                name: name.into(),
                width,
            });
        }

        if columns.is_empty() {
            return None;
        }

        let row_width = columns.iter().map(|c| u32::from(c.width)).sum::<u32>();
        let row_width = u16::try_from(row_width).ok()?;

        Some(Self { columns, row_width })
    }

    /// Renders the descriptor string.
    #[must_use]
    pub fn descriptor(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{}-{}", c.name, c.width))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Width of one payload row in bytes (the chunk size).
    #[must_use]
    pub fn row_width(&self) -> u16 {
        self.row_width
    }

    /// Width of the first column (the row key).
    #[must_use]
    pub fn row_key_width(&self) -> u16 {
        // NOTE: Schemas are never empty
        #[allow(clippy::expect_used)]
        self.columns.first().expect("schema is never empty").width
    }

    /// The columns in schema order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Whether `other` extends `self` without reinterpreting existing columns.
    ///
    /// `other` may append columns; the shared prefix must match in both
    /// name and width.
    #[must_use]
    pub fn subsumed_by(&self, other: &Self) -> bool {
        self.columns.len() <= other.columns.len()
            && self.columns.iter().zip(&other.columns).all(|(a, b)| a == b)
    }
}
