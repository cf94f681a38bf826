//! Result tables.
//!
//! A table is handed to the client as a bounded slice of the response
//! buffer. The header (status, column types and names) is parsed eagerly;
//! rows are decoded on demand by [`Table::rows`]. All views share the
//! response's storage.

use crate::buffer::ByteBuffer;
use crate::error::{WireError, WireResult};
use crate::value::{Value, WireType};

/// A single result table, backed by a shared slice of the response buffer.
#[derive(Debug, Clone)]
pub struct Table {
    buffer: ByteBuffer,
    status_code: i8,
    column_types: Vec<WireType>,
    column_names: Vec<String>,
    row_count: usize,
    rows_offset: usize,
}

impl Table {
    /// Parses the table header from a buffer spanning exactly the table
    /// payload.
    pub fn decode(buffer: ByteBuffer) -> WireResult<Self> {
        let mut cur = buffer.clone();
        // Metadata length covers the header fields; the layout is parsed
        // linearly so the value itself is not needed.
        let _metadata_len = cur.get_i32()?;
        let status_code = cur.get_i8()?;

        let column_count = cur.get_i16()?;
        if column_count < 0 {
            return Err(WireError::InvalidLength(i32::from(column_count)));
        }
        let column_count = column_count as usize;

        let mut column_types = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            column_types.push(WireType::from_code(cur.get_i8()?)?);
        }
        let mut column_names = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let name = cur
                .get_string()?
                .ok_or_else(|| WireError::Malformed("null column name".into()))?;
            column_names.push(name);
        }

        let row_count = cur.get_i32()?;
        if row_count < 0 {
            return Err(WireError::InvalidLength(row_count));
        }

        Ok(Self {
            rows_offset: cur.position(),
            buffer,
            status_code,
            column_types,
            column_names,
            row_count: row_count as usize,
        })
    }

    pub fn status_code(&self) -> i8 {
        self.status_code
    }

    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.column_names.get(index).map(String::as_str)
    }

    pub fn column_type(&self, index: usize) -> Option<WireType> {
        self.column_types.get(index).copied()
    }

    /// Iterates the rows, decoding each by the column types.
    pub fn rows(&self) -> Rows<'_> {
        let mut cursor = self.buffer.clone();
        // rows_offset came from parsing this same buffer, so it is in range.
        let _ = cursor.set_position(self.rows_offset);
        Rows {
            table: self,
            cursor,
            remaining: self.row_count,
        }
    }
}

/// Row iterator over a [`Table`].
pub struct Rows<'a> {
    table: &'a Table,
    cursor: ByteBuffer,
    remaining: usize,
}

impl Rows<'_> {
    fn decode_row(&mut self) -> WireResult<Row> {
        let row_length = self.cursor.get_i32()?;
        if row_length < 0 {
            return Err(WireError::InvalidLength(row_length));
        }
        let end = self.cursor.position() + row_length as usize;

        let mut values = Vec::with_capacity(self.table.column_count());
        for &ty in &self.table.column_types {
            values.push(Value::decode_scalar(&mut self.cursor, ty)?);
        }
        if self.cursor.position() != end {
            return Err(WireError::Malformed(
                "row length does not match its columns".into(),
            ));
        }
        Ok(Row { values })
    }
}

impl Iterator for Rows<'_> {
    type Item = WireResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let row = self.decode_row();
        if row.is_err() {
            // A malformed row poisons the rest of the iteration.
            self.remaining = 0;
        }
        Some(row)
    }
}

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}
