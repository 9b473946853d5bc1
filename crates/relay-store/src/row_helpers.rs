use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Reject text columns that must never be empty (IDs, room names).
pub fn non_empty(
    value: String,
    table: &'static str,
    column: &'static str,
) -> Result<String, StoreError> {
    if value.is_empty() {
        Err(StoreError::CorruptRow {
            table,
            column,
            detail: "empty value".into(),
        })
    } else {
        Ok(value)
    }
}
