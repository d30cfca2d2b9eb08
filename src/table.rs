//! Row-oriented tables that travel inside a `Value::TableBlob`.
//!
//! A table is a fixed, ordered set of typed columns (each identified by a
//! numeric id, mirroring the way frame records are keyed) plus a dense grid
//! of rows. Encoding a table never re-walks already-encoded rows: the
//! running encoded length is tracked incrementally as rows are appended or
//! cells updated, so `encoded_len()` is O(1).
use std::fmt;
use std::io::{self, Cursor};
use std::sync::Arc;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::collections::BTreeMap;

use crate::value::{DecodeError, TypeTag, Value};

/// Display metadata for a single column: its name, and — for integer
/// columns that represent a closed enumeration — the labels for each
/// legal value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnMeta {
    pub name: String,
    pub string_interpretations: Option<BTreeMap<i64, String>>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>) -> Self {
        ColumnMeta {
            name: name.into(),
            string_interpretations: None,
        }
    }

    pub fn with_string_interpretations(mut self, map: BTreeMap<i64, String>) -> Self {
        self.string_interpretations = Some(map);
        self
    }
}

/// One column's schema: id, wire type, display metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub id: u64,
    pub tag: TypeTag,
    pub meta: ColumnMeta,
}

/// The bytes a table serializes to, shared by reference-counting rather
/// than copied on every clone.
///
/// `Owned` is produced by encoding a `Table` held locally; `Borrowed` is
/// produced while decoding a frame, where the bytes are sliced out of a
/// larger incoming buffer and handed around via a cheap `Arc` clone instead
/// of being copied into their own allocation a second time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableBlob {
    Owned(Arc<[u8]>),
    Borrowed(Arc<[u8]>),
}

impl TableBlob {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TableBlob::Owned(b) => b,
            TableBlob::Borrowed(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read an 8-byte length prefix (excluding itself) followed by that
    /// many content bytes off `cursor`, wrapping them as a `Borrowed` blob.
    /// Used for a table-within-a-table cell, where the prefix is plain
    /// content length.
    pub fn read_borrowed(cursor: &mut Cursor<&[u8]>) -> Result<TableBlob, DecodeError> {
        let len = cursor.read_u64::<LE>()? as usize;
        let pos = cursor.position() as usize;
        let slice = cursor.get_ref();
        if pos + len > slice.len() {
            return Err(DecodeError::TruncatedRecord);
        }
        let bytes: Arc<[u8]> = Arc::from(&slice[pos..pos + len]);
        cursor.set_position((pos + len) as u64);
        Ok(TableBlob::Borrowed(bytes))
    }

    /// Write this blob with an 8-byte content-length prefix (excluding
    /// itself), the form a table cell expects for a nested `TableBlob`
    /// column.
    pub fn write_prefixed(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u64::<LE>(self.len() as u64)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }

    /// Read a blob whose own first 8 bytes are its `total_length`,
    /// including those 8 bytes (the layout [`Table::encode`] produces).
    /// Used at the frame level, where a `Value::TableBlob` record carries
    /// no length prefix of its own — the blob is self-delimiting.
    pub fn read_self_delimited(cursor: &mut Cursor<&[u8]>) -> Result<TableBlob, DecodeError> {
        let start = cursor.position() as usize;
        let total_length = cursor.read_u64::<LE>()? as usize;
        let slice = cursor.get_ref();
        if total_length < 8 || start + total_length > slice.len() {
            return Err(DecodeError::TruncatedRecord);
        }
        let bytes: Arc<[u8]> = Arc::from(&slice[start..start + total_length]);
        cursor.set_position((start + total_length) as u64);
        Ok(TableBlob::Borrowed(bytes))
    }
}

/// Errors raised by table schema and row operations.
#[derive(Debug)]
pub enum TableError {
    /// Two or more columns were registered with the same id.
    DuplicateIds(u64),
    /// A row didn't supply exactly one cell per column.
    Arity { expected: usize, got: usize },
    /// A cell's `Value` variant didn't match its column's `TypeTag`.
    TypeMismatch { column: u64, expected: TypeTag },
    /// A row or column index was out of bounds.
    OutOfRange,
    Decode(DecodeError),
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TableError::DuplicateIds(id) => write!(f, "duplicate column id {id}"),
            TableError::Arity { expected, got } => {
                write!(f, "row has {got} cells, expected {expected}")
            }
            TableError::TypeMismatch { column, expected } => {
                write!(f, "column {column} expected a {expected:?} value")
            }
            TableError::OutOfRange => write!(f, "row or column index out of range"),
            TableError::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TableError {}

impl From<DecodeError> for TableError {
    fn from(e: DecodeError) -> Self {
        TableError::Decode(e)
    }
}

/// A schema-fixed, row-oriented table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
    encoded_len: usize,
}

impl Table {
    /// Build an empty table from its column schema.
    pub fn new(columns: Vec<Column>) -> Result<Table, TableError> {
        let mut seen = std::collections::HashSet::new();
        for col in &columns {
            if !seen.insert(col.id) {
                return Err(TableError::DuplicateIds(col.id));
            }
        }
        let encoded_len = BLOB_PREFIX_LEN;
        Ok(Table {
            columns,
            rows: Vec::new(),
            encoded_len,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, index: usize) -> Option<&[Value]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    /// Current encoded length in bytes, tracked incrementally so callers
    /// never have to re-walk all rows to ask "how big is this table".
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    fn check_row_types(&self, row: &[Value]) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::Arity {
                expected: self.columns.len(),
                got: row.len(),
            });
        }
        for (col, value) in self.columns.iter().zip(row.iter()) {
            if value.tag() != col.tag && !matching_opt_tags(col.tag, value.tag()) {
                return Err(TableError::TypeMismatch {
                    column: col.id,
                    expected: col.tag,
                });
            }
        }
        Ok(())
    }

    /// Append a row, validating arity and per-column type.
    pub fn append_row(&mut self, row: Vec<Value>) -> Result<(), TableError> {
        self.check_row_types(&row)?;
        let added: usize = row.iter().map(cell_encoded_len).sum();
        self.rows.push(row);
        self.encoded_len += added;
        Ok(())
    }

    /// Replace a single cell, keeping the incremental length tally correct.
    pub fn update_cell(
        &mut self,
        row_index: usize,
        col_index: usize,
        value: Value,
    ) -> Result<(), TableError> {
        let col = self.columns.get(col_index).ok_or(TableError::OutOfRange)?;
        if value.tag() != col.tag && !matching_opt_tags(col.tag, value.tag()) {
            return Err(TableError::TypeMismatch {
                column: col.id,
                expected: col.tag,
            });
        }
        let row = self
            .rows
            .get_mut(row_index)
            .ok_or(TableError::OutOfRange)?;
        let cell = row.get_mut(col_index).ok_or(TableError::OutOfRange)?;
        let old_len = cell_encoded_len(cell);
        let new_len = cell_encoded_len(&value);
        *cell = value;
        self.encoded_len = self.encoded_len - old_len + new_len;
        Ok(())
    }

    /// Drop all rows, keeping the schema.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.encoded_len = BLOB_PREFIX_LEN;
    }

    /// Replace this table's rows with the rows decoded out of `blob`,
    /// stepped using this table's own column schema — the blob carries no
    /// schema of its own, per the wire layout in [`Table::encode`].
    pub fn copy_from(&mut self, blob: &TableBlob) -> Result<(), TableError> {
        let rows = decode_rows(blob, &self.columns)?;
        let encoded_len =
            BLOB_PREFIX_LEN + rows.iter().flatten().map(cell_encoded_len).sum::<usize>();
        self.rows = rows;
        self.encoded_len = encoded_len;
        Ok(())
    }

    /// Encode this table's rows into an owned blob: an 8-byte
    /// `total_length` (counting itself) followed by the row data with no
    /// per-row framing and no embedded column schema — the schema travels
    /// separately (it's fixed per table and known to both ends).
    pub fn encode(&self) -> TableBlob {
        let mut buf = Vec::with_capacity(self.encoded_len);
        buf.write_u64::<LE>(self.encoded_len as u64).unwrap();
        for row in &self.rows {
            for cell in row {
                write_cell(&mut buf, cell).expect("writing to a Vec<u8> cannot fail");
            }
        }
        TableBlob::Owned(Arc::from(buf.into_boxed_slice()))
    }

    /// Decode a table's rows out of a blob produced by [`Table::encode`],
    /// using the given column schema.
    pub fn decode(blob: &TableBlob, columns: Vec<Column>) -> Result<Table, TableError> {
        let rows = decode_rows(blob, &columns)?;
        let mut table = Table::new(columns)?;
        for row in rows {
            table.append_row(row)?;
        }
        Ok(table)
    }
}

/// Size in bytes of a blob's leading `total_length` field.
const BLOB_PREFIX_LEN: usize = 8;

/// Step through a blob's row data (after its 8-byte `total_length` prefix)
/// using `columns` to know each row's shape.
fn decode_rows(blob: &TableBlob, columns: &[Column]) -> Result<Vec<Vec<Value>>, TableError> {
    let bytes = blob.as_bytes();
    let mut cursor = Cursor::new(bytes);
    let total_length = cursor
        .read_u64::<LE>()
        .map_err(|_| DecodeError::TruncatedRecord)? as usize;
    if total_length != bytes.len() {
        return Err(TableError::Decode(DecodeError::TruncatedRecord));
    }
    let mut rows = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let mut row = Vec::with_capacity(columns.len());
        for col in columns {
            row.push(read_cell(&mut cursor, col.tag)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn matching_opt_tags(col_tag: TypeTag, value_tag: TypeTag) -> bool {
    use TypeTag::*;
    matches!(
        (col_tag, value_tag),
        (OptI8, OptI8Empty)
            | (OptI16, OptI16Empty)
            | (OptI32, OptI32Empty)
            | (OptI64, OptI64Empty)
            | (OptU8, OptU8Empty)
            | (OptU16, OptU16Empty)
            | (OptU32, OptU32Empty)
            | (OptU64, OptU64Empty)
            | (OptF32, OptF32Empty)
            | (OptF64, OptF64Empty)
            | (Str, StrEmpty)
    )
}

/// Length in bytes of a single cell's tagless, in-table encoding.
fn cell_encoded_len(value: &Value) -> usize {
    match value {
        Value::I8(_) | Value::U8(_) | Value::Bool(_) => 1,
        Value::I16(_) | Value::U16(_) => 2,
        Value::I32(_) | Value::U32(_) | Value::F32(_) => 4,
        Value::I64(_) | Value::U64(_) | Value::F64(_) => 8,
        Value::Timestamp(_) | Value::Duration(_) => 8,
        Value::Str(s) => 8 + s.len(),
        Value::OptI8(v) => 1 + if v.is_some() { 1 } else { 0 },
        Value::OptI16(v) => 1 + if v.is_some() { 2 } else { 0 },
        Value::OptI32(v) => 1 + if v.is_some() { 4 } else { 0 },
        Value::OptI64(v) => 1 + if v.is_some() { 8 } else { 0 },
        Value::OptU8(v) => 1 + if v.is_some() { 1 } else { 0 },
        Value::OptU16(v) => 1 + if v.is_some() { 2 } else { 0 },
        Value::OptU32(v) => 1 + if v.is_some() { 4 } else { 0 },
        Value::OptU64(v) => 1 + if v.is_some() { 8 } else { 0 },
        Value::OptF32(v) => 1 + if v.is_some() { 4 } else { 0 },
        Value::OptF64(v) => 1 + if v.is_some() { 8 } else { 0 },
        Value::TableBlob(blob) => 8 + blob.len(),
    }
}

/// Write a cell with no leading type tag (the column schema already
/// supplies the type). Optional columns get a 1-byte presence prefix
/// (0 = present, 1 = absent); strings always carry an 8-byte length
/// prefix, with length 0 meaning an empty string (no separate empty tag
/// inside a table, unlike at the frame level).
fn write_cell(buf: &mut Vec<u8>, value: &Value) -> io::Result<()> {
    match value {
        Value::I8(v) => buf.write_i8(*v),
        Value::I16(v) => buf.write_i16::<LE>(*v),
        Value::I32(v) => buf.write_i32::<LE>(*v),
        Value::I64(v) => buf.write_i64::<LE>(*v),
        Value::U8(v) => buf.write_u8(*v),
        Value::U16(v) => buf.write_u16::<LE>(*v),
        Value::U32(v) => buf.write_u32::<LE>(*v),
        Value::U64(v) => buf.write_u64::<LE>(*v),
        Value::F32(v) => buf.write_f32::<LE>(*v),
        Value::F64(v) => buf.write_f64::<LE>(*v),
        Value::Bool(v) => buf.write_u8(*v as u8),
        Value::Timestamp(t) => buf.write_u64::<LE>(t.nanos()),
        Value::Duration(d) => buf.write_i64::<LE>(d.nanos()),
        Value::Str(s) => {
            buf.write_u64::<LE>(s.len() as u64)?;
            buf.extend_from_slice(s.as_bytes());
            Ok(())
        }
        Value::OptI8(v) => write_cell_opt(buf, v, |b, x| b.write_i8(x)),
        Value::OptI16(v) => write_cell_opt(buf, v, |b, x| b.write_i16::<LE>(x)),
        Value::OptI32(v) => write_cell_opt(buf, v, |b, x| b.write_i32::<LE>(x)),
        Value::OptI64(v) => write_cell_opt(buf, v, |b, x| b.write_i64::<LE>(x)),
        Value::OptU8(v) => write_cell_opt(buf, v, |b, x| b.write_u8(x)),
        Value::OptU16(v) => write_cell_opt(buf, v, |b, x| b.write_u16::<LE>(x)),
        Value::OptU32(v) => write_cell_opt(buf, v, |b, x| b.write_u32::<LE>(x)),
        Value::OptU64(v) => write_cell_opt(buf, v, |b, x| b.write_u64::<LE>(x)),
        Value::OptF32(v) => write_cell_opt(buf, v, |b, x| b.write_f32::<LE>(x)),
        Value::OptF64(v) => write_cell_opt(buf, v, |b, x| b.write_f64::<LE>(x)),
        Value::TableBlob(blob) => blob.write_prefixed(buf),
    }
}

fn write_cell_opt<T: Copy>(
    buf: &mut Vec<u8>,
    v: &Option<T>,
    write: impl FnOnce(&mut Vec<u8>, T) -> io::Result<()>,
) -> io::Result<()> {
    match v {
        Some(x) => {
            buf.write_u8(0)?;
            write(buf, *x)
        }
        None => buf.write_u8(1),
    }
}

/// Read a cell whose type is already known from the column schema.
fn read_cell(cursor: &mut Cursor<&[u8]>, tag: TypeTag) -> Result<Value, TableError> {
    Ok(match tag {
        TypeTag::I8 => Value::I8(cursor.read_i8().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::I16 => Value::I16(cursor.read_i16::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::I32 => Value::I32(cursor.read_i32::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::I64 => Value::I64(cursor.read_i64::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::U8 => Value::U8(cursor.read_u8().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::U16 => Value::U16(cursor.read_u16::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::U32 => Value::U32(cursor.read_u32::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::U64 => Value::U64(cursor.read_u64::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::F32 => Value::F32(cursor.read_f32::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::F64 => Value::F64(cursor.read_f64::<LE>().map_err(|_| DecodeError::TruncatedRecord)?),
        TypeTag::Bool => Value::Bool(cursor.read_u8().map_err(|_| DecodeError::TruncatedRecord)? != 0),
        TypeTag::Timestamp => Value::Timestamp(crate::value::Timestamp::from_nanos(
            cursor.read_u64::<LE>().map_err(|_| DecodeError::TruncatedRecord)?,
        )),
        TypeTag::Duration => Value::Duration(crate::value::Duration::from_nanos(
            cursor.read_i64::<LE>().map_err(|_| DecodeError::TruncatedRecord)?,
        )),
        TypeTag::Str | TypeTag::StrEmpty => {
            let len = cursor.read_u64::<LE>().map_err(|_| DecodeError::TruncatedRecord)? as usize;
            let pos = cursor.position() as usize;
            let slice = cursor.get_ref();
            if pos + len > slice.len() {
                return Err(TableError::Decode(DecodeError::TruncatedRecord));
            }
            let s = std::str::from_utf8(&slice[pos..pos + len])
                .map_err(|_| DecodeError::TruncatedRecord)?
                .to_string();
            cursor.set_position((pos + len) as u64);
            Value::Str(s)
        }
        TypeTag::OptI8 | TypeTag::OptI8Empty => {
            Value::OptI8(read_cell_opt(cursor, |c| c.read_i8())?)
        }
        TypeTag::OptI16 | TypeTag::OptI16Empty => {
            Value::OptI16(read_cell_opt(cursor, |c| c.read_i16::<LE>())?)
        }
        TypeTag::OptI32 | TypeTag::OptI32Empty => {
            Value::OptI32(read_cell_opt(cursor, |c| c.read_i32::<LE>())?)
        }
        TypeTag::OptI64 | TypeTag::OptI64Empty => {
            Value::OptI64(read_cell_opt(cursor, |c| c.read_i64::<LE>())?)
        }
        TypeTag::OptU8 | TypeTag::OptU8Empty => {
            Value::OptU8(read_cell_opt(cursor, |c| c.read_u8())?)
        }
        TypeTag::OptU16 | TypeTag::OptU16Empty => {
            Value::OptU16(read_cell_opt(cursor, |c| c.read_u16::<LE>())?)
        }
        TypeTag::OptU32 | TypeTag::OptU32Empty => {
            Value::OptU32(read_cell_opt(cursor, |c| c.read_u32::<LE>())?)
        }
        TypeTag::OptU64 | TypeTag::OptU64Empty => {
            Value::OptU64(read_cell_opt(cursor, |c| c.read_u64::<LE>())?)
        }
        TypeTag::OptF32 | TypeTag::OptF32Empty => {
            Value::OptF32(read_cell_opt(cursor, |c| c.read_f32::<LE>())?)
        }
        TypeTag::OptF64 | TypeTag::OptF64Empty => {
            Value::OptF64(read_cell_opt(cursor, |c| c.read_f64::<LE>())?)
        }
        TypeTag::TableBlob => Value::TableBlob(TableBlob::read_borrowed(cursor)?),
    })
}

fn read_cell_opt<T>(
    cursor: &mut Cursor<&[u8]>,
    read: impl FnOnce(&mut Cursor<&[u8]>) -> io::Result<T>,
) -> Result<Option<T>, DecodeError> {
    let presence = cursor.read_u8()?;
    match presence {
        0 => Ok(Some(read(cursor)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_columns() -> Vec<Column> {
        vec![
            Column {
                id: 1,
                tag: TypeTag::U32,
                meta: ColumnMeta::new("id"),
            },
            Column {
                id: 2,
                tag: TypeTag::Str,
                meta: ColumnMeta::new("label"),
            },
            Column {
                id: 3,
                tag: TypeTag::OptF64,
                meta: ColumnMeta::new("reading"),
            },
        ]
    }

    #[test]
    fn append_and_encode_round_trips() {
        let mut table = Table::new(sample_columns()).unwrap();
        table
            .append_row(vec![
                Value::U32(1),
                Value::Str("alpha".to_string()),
                Value::OptF64(Some(1.5)),
            ])
            .unwrap();
        table
            .append_row(vec![
                Value::U32(2),
                Value::Str(String::new()),
                Value::OptF64(None),
            ])
            .unwrap();

        let blob = table.encode();
        assert_eq!(blob.len(), table.encoded_len());

        let decoded = Table::decode(&blob, sample_columns()).unwrap();
        assert_eq!(decoded.row_count(), 2);
        assert_eq!(decoded.row(0).unwrap()[1], Value::Str("alpha".to_string()));
        assert_eq!(decoded.row(1).unwrap()[2], Value::OptF64(None));
    }

    #[test]
    fn update_cell_keeps_length_tally_correct() {
        let mut table = Table::new(sample_columns()).unwrap();
        table
            .append_row(vec![
                Value::U32(1),
                Value::Str("a".to_string()),
                Value::OptF64(None),
            ])
            .unwrap();
        let before = table.encoded_len();
        table
            .update_cell(0, 1, Value::Str("much longer label".to_string()))
            .unwrap();
        assert_eq!(
            table.encoded_len(),
            before + "much longer label".len() - "a".len()
        );
        let expected: usize = table
            .columns()
            .iter()
            .map(|_| 0)
            .sum::<usize>();
        let _ = expected;
    }

    #[test]
    fn copy_from_steps_rows_using_the_receivers_schema() {
        let mut src = Table::new(sample_columns()).unwrap();
        src.append_row(vec![
            Value::U32(1),
            Value::Str("alpha".to_string()),
            Value::OptF64(Some(1.5)),
        ])
        .unwrap();
        let blob = src.encode();

        let mut dest = Table::new(sample_columns()).unwrap();
        dest.copy_from(&blob).unwrap();
        assert_eq!(dest.row_count(), 1);
        assert_eq!(dest.encoded_len(), src.encoded_len());
    }

    #[test]
    fn duplicate_column_ids_rejected() {
        let mut cols = sample_columns();
        cols[1].id = cols[0].id;
        assert!(matches!(Table::new(cols), Err(TableError::DuplicateIds(_))));
    }

    #[test]
    fn arity_mismatch_rejected() {
        let mut table = Table::new(sample_columns()).unwrap();
        let result = table.append_row(vec![Value::U32(1)]);
        assert!(matches!(result, Err(TableError::Arity { .. })));
    }
}
