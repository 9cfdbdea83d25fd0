use core::ffi::CStr;
use std::ffi::CString;
use std::sync::{Arc, Weak};

use crate::cursor::RowCursor;
use crate::error::{Error, ErrorCode, Result};

/// Fully materialized query result produced by the embedding driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultSet {
    /// Column names, in result order.
    pub columns: Vec<String>,
    /// Rows; `None` marks an SQL NULL cell.
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// Build a resultset from column names and rows.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }
}

/// Connection on the embedding side that runs queries for the native library.
///
/// `fetch` is a synchronous round-trip and may block on network I/O. The
/// query arrives as the bytes the native library sent; decoding them is up to
/// the implementation.
pub trait ForeignConnection: Send + Sync {
    /// Run `query` and return the complete resultset.
    fn fetch(&self, query: &CStr) -> Result<ResultSet>;
}

/// Row cursor over resultsets fetched from a [`ForeignConnection`].
///
/// The bridge only holds a weak reference to the connection. Rows and column
/// names are copied into bridge-owned storage on `load`; pointers returned by
/// `get` stay valid until the next `load`, `clear`, or destruction.
pub struct CursorBridge<F: ForeignConnection + ?Sized> {
    foreign: Weak<F>,
    rows: Vec<Vec<Option<CString>>>,
    columns: Vec<String>,
    row_index: i32,
    row_count: i32,
    column_count: i32,
    error_code: Option<ErrorCode>,
    last_error: Option<Error>,
}

impl<F: ForeignConnection + ?Sized> CursorBridge<F> {
    /// Bind a new bridge to `foreign` without taking ownership of it.
    pub fn new(foreign: &Arc<F>) -> Self {
        Self {
            foreign: Arc::downgrade(foreign),
            rows: Vec::new(),
            columns: Vec::new(),
            row_index: -1,
            row_count: -1,
            column_count: -1,
            error_code: None,
            last_error: None,
        }
    }

    /// Current row position; -1 before the first row.
    pub fn row_index(&self) -> i32 {
        self.row_index
    }

    /// Columns in the current resultset; -1 when nothing is loaded.
    pub fn column_count(&self) -> i32 {
        self.column_count
    }

    /// Failure category of the last `load`; `None` after a success.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    /// Error of the last failed `load`, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn release(&mut self) {
        self.rows = Vec::new();
        self.columns = Vec::new();
        self.row_index = -1;
    }

    fn fail(&mut self, err: Error) -> Result<()> {
        tracing::warn!(code = ?err.code, error = %err, "cursor load failed");
        self.error_code = Some(err.code);
        self.last_error = Some(err.clone());
        Err(err)
    }
}

fn decode(set: ResultSet) -> Result<(Vec<String>, Vec<Vec<Option<CString>>>)> {
    let width = set.columns.len();
    let mut rows = Vec::with_capacity(set.rows.len());
    for (idx, row) in set.rows.into_iter().enumerate() {
        if row.len() != width {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("row {} has {} values, expected {}", idx, row.len(), width),
            ));
        }
        let mut cells = Vec::with_capacity(width);
        for cell in row {
            let cell = match cell {
                Some(text) => Some(CString::new(text).map_err(|_| {
                    Error::with_message(ErrorCode::Misuse, "value contains NUL")
                })?),
                None => None,
            };
            cells.push(cell);
        }
        rows.push(cells);
    }
    Ok((set.columns, rows))
}

impl<F: ForeignConnection + ?Sized> RowCursor for CursorBridge<F> {
    fn load(&mut self, query: &CStr) -> Result<()> {
        self.release();
        self.row_count = -1;
        self.column_count = -1;
        let Some(foreign) = self.foreign.upgrade() else {
            return self.fail(Error::foreign("foreign connection is closed"));
        };
        let set = match foreign.fetch(query) {
            Ok(set) => set,
            Err(err) => return self.fail(err),
        };
        let (columns, rows) = match decode(set) {
            Ok(decoded) => decoded,
            Err(err) => return self.fail(err),
        };
        if rows.len() > i32::MAX as usize || columns.len() > i32::MAX as usize {
            return self.fail(Error::with_message(ErrorCode::Misuse, "resultset too large"));
        }
        self.row_count = rows.len() as i32;
        self.column_count = columns.len() as i32;
        self.rows = rows;
        self.columns = columns;
        self.error_code = None;
        self.last_error = None;
        tracing::debug!(
            rows = self.row_count,
            columns = self.column_count,
            "cursor loaded"
        );
        Ok(())
    }

    fn next(&mut self) -> bool {
        if self.row_index + 1 < self.row_count {
            self.row_index += 1;
            true
        } else {
            false
        }
    }

    fn get(&self, col: i32) -> Option<&CStr> {
        if self.row_index < 0 || self.row_index >= self.row_count {
            tracing::warn!(
                row_index = self.row_index,
                row_count = self.row_count,
                "cursor is not positioned on a row"
            );
            return None;
        }
        if col < 0 || col >= self.column_count {
            tracing::warn!(
                column = col,
                column_count = self.column_count,
                "column index out of range"
            );
            return None;
        }
        self.rows
            .get(self.row_index as usize)?
            .get(col as usize)?
            .as_deref()
    }

    fn column_index(&self, name: &CStr) -> i32 {
        let name = name.to_bytes();
        self.columns
            .iter()
            .position(|column| column.as_bytes().eq_ignore_ascii_case(name))
            .map_or(-1, |idx| idx as i32)
    }

    fn clear(&mut self) {
        self.release();
        self.row_count = 0;
        self.column_count = 0;
        tracing::debug!("cursor cleared");
    }

    fn row_count(&self) -> i32 {
        self.row_count
    }
}

impl<F: ForeignConnection + ?Sized> Drop for CursorBridge<F> {
    fn drop(&mut self) {
        self.clear();
    }
}
