//! Tables of typed rows keyed by element index.

use crate::value::CellValue;
use std::collections::BTreeMap;

/// One row: attribute name to value.
pub type Row = BTreeMap<String, CellValue>;

/// A table of one element kind.
///
/// Every row holds a value for every column (possibly `Missing`); rows are
/// kept in ascending index order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub kind: String,
    columns: Vec<String>,
    rows: BTreeMap<i64, Row>,
}

impl Table {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            columns: Vec::new(),
            rows: BTreeMap::new(),
        }
    }

    pub fn with_columns<S: Into<String>>(
        kind: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        let mut table = Self::new(kind);
        for column in columns {
            table.add_column(column);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Append a column, backfilling `Missing`; no-op if it already exists.
    pub fn add_column(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.has_column(&name) {
            return;
        }
        for row in self.rows.values_mut() {
            row.entry(name.clone()).or_default();
        }
        self.columns.push(name);
    }

    /// Rename a column in place, keeping its position. Returns whether it existed.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        let Some(pos) = self.columns.iter().position(|c| c == from) else {
            return false;
        };
        self.columns[pos] = to.to_string();
        for row in self.rows.values_mut() {
            let value = row.remove(from).unwrap_or_default();
            row.insert(to.to_string(), value);
        }
        true
    }

    /// Remove a column and its cells. Returns whether it existed.
    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(pos) = self.columns.iter().position(|c| c == name) else {
            return false;
        };
        self.columns.remove(pos);
        for row in self.rows.values_mut() {
            row.remove(name);
        }
        true
    }

    /// Insert or replace the row at `index`. Unknown attributes become new
    /// columns; absent columns are filled with `Missing`.
    pub fn insert_row(&mut self, index: i64, mut row: Row) {
        for name in row.keys() {
            if !self.has_column(name) {
                self.columns.push(name.clone());
                for other in self.rows.values_mut() {
                    other.entry(name.clone()).or_default();
                }
            }
        }
        for column in &self.columns {
            row.entry(column.clone()).or_default();
        }
        self.rows.insert(index, row);
    }

    pub fn remove_row(&mut self, index: i64) -> Option<Row> {
        self.rows.remove(&index)
    }

    pub fn row(&self, index: i64) -> Option<&Row> {
        self.rows.get(&index)
    }

    pub fn get(&self, index: i64, column: &str) -> Option<&CellValue> {
        self.rows.get(&index)?.get(column)
    }

    /// Set one cell; the column is created if needed. Returns false if the row is absent.
    pub fn set(&mut self, index: i64, column: &str, value: CellValue) -> bool {
        if !self.rows.contains_key(&index) {
            return false;
        }
        self.add_column(column);
        if let Some(row) = self.rows.get_mut(&index) {
            row.insert(column.to_string(), value);
        }
        true
    }

    pub fn rows(&self) -> impl Iterator<Item = (i64, &Row)> {
        self.rows.iter().map(|(index, row)| (*index, row))
    }

    pub fn indices(&self) -> Vec<i64> {
        self.rows.keys().copied().collect()
    }

    pub fn max_index(&self) -> Option<i64> {
        self.rows.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column values in index order.
    pub fn column(&self, name: &str) -> Vec<&CellValue> {
        self.rows.values().filter_map(|row| row.get(name)).collect()
    }
}

/// Build a row from `(attribute, value)` pairs.
pub fn row<K: Into<String>, V: Into<CellValue>>(cells: impl IntoIterator<Item = (K, V)>) -> Row {
    cells
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
