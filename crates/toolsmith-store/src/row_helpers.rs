use chrono::{DateTime, Utc};
use rusqlite::types::FromSql;
use rusqlite::Row;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// A `(table, column)` pair used to decode one cell and name it in errors.
#[derive(Clone, Copy, Debug)]
pub struct Column {
    pub table: &'static str,
    pub name: &'static str,
    pub index: usize,
}

pub const fn col(table: &'static str, name: &'static str, index: usize) -> Column {
    Column { table, name, index }
}

impl Column {
    fn corrupt(&self, detail: impl Into<String>) -> StoreError {
        StoreError::CorruptRow {
            table: self.table,
            column: self.name,
            detail: detail.into(),
        }
    }

    pub fn read<T: FromSql>(&self, row: &Row<'_>) -> Result<T, StoreError> {
        row.get(self.index).map_err(|e| self.corrupt(e.to_string()))
    }

    /// JSON text column.
    pub fn json<T: DeserializeOwned>(&self, row: &Row<'_>) -> Result<T, StoreError> {
        let raw: String = self.read(row)?;
        self.parse_json(&raw)
    }

    pub fn parse_json<T: DeserializeOwned>(&self, raw: &str) -> Result<T, StoreError> {
        serde_json::from_str(raw).map_err(|e| self.corrupt(format!("invalid JSON: {e}")))
    }

    /// Text column holding a `FromStr` value such as a step or status name.
    pub fn parsed<T: std::str::FromStr>(&self, row: &Row<'_>) -> Result<T, StoreError> {
        let raw: String = self.read(row)?;
        raw.parse().map_err(|_| self.corrupt(format!("unknown variant: {raw}")))
    }

    /// RFC 3339 text column.
    pub fn timestamp(&self, row: &Row<'_>) -> Result<DateTime<Utc>, StoreError> {
        let raw: String = self.read(row)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| self.corrupt(e.to_string()))
    }
}
