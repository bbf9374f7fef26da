//! Fixed-format tables: delimited text on one side, packed binary rows on the other.
//!
//! A table has an optional header row followed by any number of data rows. Every row is
//! laid out like a small packet, with column byte positions relative to the row start.
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cmd::parse_token;
use crate::field::{resolve_layout, FieldDefinition};
use crate::{Error, Result, Value};

/// Table columns share their definition with packet fields.
pub type ColumnDefinition = FieldDefinition;

#[derive(Debug, Clone)]
pub struct TableDefinition {
    name: String,
    delimiter: String,
    desc: Option<String>,
    size: Option<usize>,
    header: Vec<ColumnDefinition>,
    columns: Vec<ColumnDefinition>,
    header_nbytes: usize,
    row_nbytes: usize,
}

impl TableDefinition {
    /// Build a table, resolving header and row layouts independently.
    ///
    /// # Errors
    /// [Error::Schema] if a column fails its definition checks, column names repeat, or a
    /// table has no data columns.
    pub fn new(
        name: impl Into<String>,
        mut header: Vec<ColumnDefinition>,
        mut columns: Vec<ColumnDefinition>,
    ) -> Result<Self> {
        let name = name.into();
        if columns.is_empty() {
            return Err(Error::Schema(format!("table {name} has no columns")));
        }
        let header_nbytes = resolve_layout(&mut header, 0);
        let row_nbytes = resolve_layout(&mut columns, 0);
        for cols in [&header, &columns] {
            let mut seen = HashSet::new();
            for col in cols {
                col.check()?;
                if !seen.insert(col.name()) {
                    return Err(Error::Schema(format!(
                        "table {name} has duplicate column {}",
                        col.name()
                    )));
                }
            }
        }
        Ok(Self {
            name,
            delimiter: ",".to_string(),
            desc: None,
            size: None,
            header,
            columns,
            header_nbytes,
            row_nbytes,
        })
    }

    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    #[must_use]
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Largest permitted encoded length.
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    #[must_use]
    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    #[must_use]
    pub fn header(&self) -> &[ColumnDefinition] {
        &self.header
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    #[must_use]
    pub fn header_nbytes(&self) -> usize {
        self.header_nbytes
    }

    #[must_use]
    pub fn row_nbytes(&self) -> usize {
        self.row_nbytes
    }

    /// Encode text rows into binary.
    ///
    /// Blank lines are skipped. If `hdr_vals` is given it supplies the header row,
    /// otherwise the first non-blank line does.
    ///
    /// # Example
    /// ```
    /// use gds::table::{ColumnDefinition, TableDefinition};
    /// use gds::types::TypeRegistry;
    ///
    /// let types = TypeRegistry::default();
    /// let col = |name: &str, dtype: &str| {
    ///     ColumnDefinition::builder().name(name).dtype(types.get(dtype).unwrap()).build()
    /// };
    /// let table = TableDefinition::new(
    ///     "example",
    ///     vec![col("MAGIC", "U8")],
    ///     vec![col("A", "MSB_U16"), col("B", "U8")],
    /// )
    /// .unwrap();
    ///
    /// let bytes = table.encode(["7", "1,2", "3,4"], None).unwrap();
    /// assert_eq!(bytes, [7, 0, 1, 2, 0, 3, 4]);
    /// ```
    ///
    /// # Errors
    /// [Error::MalformedTable] if a row has the wrong number of values,
    /// [Error::OutOfRange] if the result exceeds the table size, or any column encode error.
    pub fn encode<'a, I>(&self, lines: I, hdr_vals: Option<&[Value]>) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut lines = lines.into_iter().map(str::trim).filter(|l| !l.is_empty());
        let mut out = Vec::new();

        if !self.header.is_empty() {
            let values = match hdr_vals {
                Some(vals) => vals.to_vec(),
                None => {
                    let line = lines.next().ok_or_else(|| {
                        Error::MalformedTable(format!("table {} is missing its header", self.name))
                    })?;
                    self.parse_line(&self.header, line, 0)?
                }
            };
            out.extend(Self::encode_row(&self.header, self.header_nbytes, &values)?);
        }

        for (n, line) in lines.enumerate() {
            let values = self.parse_line(&self.columns, line, n + 1)?;
            out.extend(Self::encode_row(&self.columns, self.row_nbytes, &values)?);
        }

        if let Some(size) = self.size {
            if out.len() > size {
                return Err(Error::OutOfRange(format!(
                    "table {} encodes to {} bytes, more than its size of {size}",
                    self.name,
                    out.len()
                )));
            }
        }
        Ok(out)
    }

    fn parse_line(&self, cols: &[ColumnDefinition], line: &str, row: usize) -> Result<Vec<Value>> {
        let cells: Vec<&str> = line.split(self.delimiter.as_str()).collect();
        if cells.len() != cols.len() {
            return Err(Error::MalformedTable(format!(
                "row {row} of table {} has {} values, expected {}",
                self.name,
                cells.len(),
                cols.len()
            )));
        }
        cols.iter().zip(cells).map(|(c, t)| parse_cell(c, t)).collect()
    }

    fn encode_row(cols: &[ColumnDefinition], nbytes: usize, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != cols.len() {
            return Err(Error::MalformedTable(format!(
                "expected {} values, got {}",
                cols.len(),
                values.len()
            )));
        }
        let mut buf = vec![0u8; nbytes];
        for (col, value) in cols.iter().zip(values) {
            col.write(&mut buf, 0, value)?;
        }
        Ok(buf)
    }

    /// Decode every row, header first.
    ///
    /// # Errors
    /// The first error produced by [decode_iter](Self::decode_iter).
    pub fn decode(&self, bytes: &[u8], raw: bool) -> Result<Vec<Vec<Value>>> {
        self.decode_iter(bytes, raw).collect()
    }

    /// Iterate decoded rows, header first. Iteration stops after the first error.
    #[must_use]
    pub fn decode_iter<'a>(&'a self, bytes: &'a [u8], raw: bool) -> TableDecoder<'a> {
        TableDecoder {
            defn: self,
            bytes,
            raw,
            pos: 0,
            header_done: self.header.is_empty(),
            failed: false,
        }
    }

    /// Read text rows from `reader` and write the encoded table to `writer`, returning the
    /// number of bytes written.
    ///
    /// # Errors
    /// I/O errors and anything [encode](Self::encode) returns.
    pub fn encode_file<R, W>(
        &self,
        reader: R,
        mut writer: W,
        hdr_vals: Option<&[Value]>,
    ) -> Result<usize>
    where
        R: BufRead,
        W: Write,
    {
        let lines = reader.lines().collect::<std::io::Result<Vec<_>>>()?;
        let bytes = self.encode(lines.iter().map(String::as_str), hdr_vals)?;
        writer.write_all(&bytes)?;
        debug!(table = %self.name, nbytes = bytes.len(), "encoded table");
        Ok(bytes.len())
    }

    /// Decode a binary table from `reader`, writing one delimited line per row to
    /// `writer`. Returns the number of rows written, header included.
    ///
    /// Rows decoded before an error are already written when the error is returned.
    ///
    /// # Errors
    /// I/O errors and anything [decode_iter](Self::decode_iter) yields.
    pub fn decode_file<R, W>(&self, mut reader: R, mut writer: W, raw: bool) -> Result<usize>
    where
        R: Read,
        W: Write,
    {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let mut count = 0;
        for (n, row) in self.decode_iter(&bytes, raw).enumerate() {
            let row = row?;
            let cols = if n == 0 && !self.header.is_empty() {
                &self.header
            } else {
                &self.columns
            };
            let cells: Vec<String> = cols
                .iter()
                .zip(&row)
                .map(|(c, v)| render_cell(c, v, &self.delimiter))
                .collect();
            writeln!(writer, "{}", cells.join(&self.delimiter))?;
            count += 1;
        }
        debug!(table = %self.name, rows = count, "decoded table");
        Ok(count)
    }
}

/// Separator between the elements of a numeric array cell.
const ELEM_SEPARATOR: &str = " ";

/// Turn one text cell into a value suitable for `col`.
///
/// Array cells hold whitespace separated elements. A byte array cell that is not exactly
/// that is read as literal text, NUL padded to the array width.
fn parse_cell(col: &ColumnDefinition, text: &str) -> Result<Value> {
    let text = text.trim();
    if let Some(array) = col.dtype().as_array() {
        let items: Vec<Value> = text.split_whitespace().map(parse_token).collect();
        let numeric =
            items.len() == array.nelems() && items.iter().all(|v| v.as_f64().is_some());
        if numeric || !array.is_bytes() {
            return Ok(Value::List(items));
        }
        let bytes = text.as_bytes();
        if bytes.len() > array.nelems() {
            return Err(Error::OutOfRange(format!(
                "'{text}' is longer than {} bytes for column {}",
                array.nelems(),
                col.name()
            )));
        }
        let mut items: Vec<Value> = bytes.iter().map(|b| Value::from(*b)).collect();
        items.resize(array.nelems(), Value::Int(0));
        return Ok(Value::List(items));
    }
    if col.dtype().as_time().is_some() {
        if let Ok(t) = DateTime::parse_from_rfc3339(text) {
            return Ok(Value::Time(t.with_timezone(&Utc)));
        }
    }
    if col.enumeration().is_some_and(|e| e.code(text).is_some()) {
        return Ok(Value::Str(text.to_string()));
    }
    Ok(parse_token(text))
}

fn render_cell(col: &ColumnDefinition, value: &Value, delimiter: &str) -> String {
    let (Some(array), Value::List(items)) = (col.dtype().as_array(), value) else {
        return value.to_string();
    };
    if array.is_bytes() && array.nelems() > 1 {
        if let Some(text) = byte_text(items).filter(|t| !t.contains(delimiter)) {
            return text;
        }
    }
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(ELEM_SEPARATOR)
}

/// Printable ASCII held in a NUL padded byte array, if that is what `items` is.
fn byte_text(items: &[Value]) -> Option<String> {
    let bytes = items
        .iter()
        .map(|v| v.as_i128().and_then(|b| u8::try_from(b).ok()))
        .collect::<Option<Vec<u8>>>()?;
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let text = &bytes[..end];
    let printable = text.iter().all(|b| (0x20..=0x7e).contains(b));
    let padded = text.first().is_some_and(u8::is_ascii_whitespace)
        || text.last().is_some_and(u8::is_ascii_whitespace);
    if !printable || padded {
        return None;
    }
    String::from_utf8(text.to_vec()).ok()
}

/// Row iterator returned by [TableDefinition::decode_iter].
#[derive(Debug)]
pub struct TableDecoder<'a> {
    defn: &'a TableDefinition,
    bytes: &'a [u8],
    raw: bool,
    pos: usize,
    header_done: bool,
    failed: bool,
}

impl TableDecoder<'_> {
    fn decode_row(&mut self, cols: &[ColumnDefinition], nbytes: usize) -> Result<Vec<Value>> {
        let end = self.pos + nbytes;
        let Some(row) = self.bytes.get(self.pos..end) else {
            return Err(Error::MalformedTable(format!(
                "table {} ends {} bytes into a {nbytes} byte row",
                self.defn.name,
                self.bytes.len() - self.pos
            )));
        };
        let mut values = Vec::with_capacity(cols.len());
        for col in cols {
            let value = col.decode(row, self.raw, None)?;
            if !self.raw && col.enumeration().is_some() {
                if let Value::Int(code) = value {
                    warn!(table = %self.defn.name, column = col.name(), code, "unrecognized enumeration value");
                }
            }
            values.push(value);
        }
        self.pos = end;
        Ok(values)
    }
}

impl Iterator for TableDecoder<'_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let defn = self.defn;
        if self.pos >= self.bytes.len() {
            return None;
        }
        let result = if self.header_done {
            if defn.row_nbytes == 0 {
                return None;
            }
            self.decode_row(&defn.columns, defn.row_nbytes)
        } else {
            self.header_done = true;
            self.decode_row(&defn.header, defn.header_nbytes)
        };
        self.failed = result.is_err();
        Some(result)
    }
}

/// Table definitions by name.
#[derive(Debug, Default)]
pub struct TableDictionary {
    tables: HashMap<String, Arc<TableDefinition>>,
}

impl TableDictionary {
    /// # Errors
    /// [Error::Schema] if a table with the same name exists.
    pub fn add(&mut self, defn: TableDefinition) -> Result<Arc<TableDefinition>> {
        if self.tables.contains_key(defn.name()) {
            return Err(Error::Schema(format!("Duplicate table name {}", defn.name())));
        }
        let defn = Arc::new(defn);
        self.tables.insert(defn.name().to_string(), defn.clone());
        Ok(defn)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<TableDefinition>> {
        self.tables.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TableDefinition>> {
        self.tables.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{ByteSpec, Enumeration};
    use crate::types::TypeRegistry;

    fn col(name: &str, dtype: &str, bytes: ByteSpec) -> ColumnDefinition {
        ColumnDefinition::builder()
            .name(name)
            .dtype(TypeRegistry::default().get(dtype).unwrap())
            .bytes(bytes)
            .build()
    }

    fn test_table() -> TableDefinition {
        let enum_col = ColumnDefinition::builder()
            .name("COLUMN_THREE")
            .dtype(TypeRegistry::default().get("U8").unwrap())
            .bytes(ByteSpec::Single(4))
            .enumeration(
                Enumeration::new((0..4).map(|i| (i, format!("TEST_ENUM_{i}")))).unwrap(),
            )
            .build();
        TableDefinition::new(
            "test_type",
            vec![
                col("MAGIC_NUM", "U8", ByteSpec::Single(0)),
                col("UPTYPE", "U8", ByteSpec::Single(1)),
                col("VERSION", "U8", ByteSpec::Single(2)),
            ],
            vec![
                col("COLUMN_ONE", "MSB_U16", ByteSpec::Range(0, 1)),
                col("COLUMN_TWO", "MSB_U16", ByteSpec::Range(2, 3)),
                enum_col,
            ],
        )
        .unwrap()
    }

    #[test]
    fn encode_enum_names() {
        let table = test_table();
        let encoded = table
            .encode(["13,12,11", "1,2,TEST_ENUM_3", "4,5,TEST_ENUM_0"], None)
            .unwrap();
        assert_eq!(encoded, [13, 12, 11, 0, 1, 0, 2, 3, 0, 4, 0, 5, 0]);
    }

    #[test]
    fn encode_with_header_values() {
        let table = test_table();
        let hdr = [13, 12, 11].map(Value::Int);
        let encoded = table.encode(["", "  1,2,3", "4,5,6 ", ""], Some(&hdr)).unwrap();
        assert_eq!(encoded, [13, 12, 11, 0, 1, 0, 2, 3, 0, 4, 0, 5, 6]);
    }

    #[test]
    fn decode_rows() {
        let table = test_table();
        let encoded = table.encode(["13,12,11", "1,2,8", "4,5,TEST_ENUM_1"], None).unwrap();
        let rows = table.decode(&encoded, false).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], [13, 12, 11].map(Value::Int).to_vec());
        // unknown codes come back as the number
        assert_eq!(rows[1], [1, 2, 8].map(Value::Int).to_vec());
        assert_eq!(rows[2][2], Value::from("TEST_ENUM_1"));

        let raw = table.decode(&encoded, true).unwrap();
        assert_eq!(raw[2][2], Value::Int(1));
    }

    #[test]
    fn truncated_row() {
        let table = test_table();
        let mut encoded = table.encode(["13,12,11", "1,2,3", "4,5,6"], None).unwrap();
        encoded.truncate(encoded.len() - 2);
        let rows: Vec<_> = table.decode_iter(&encoded, false).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].is_ok());
        assert!(matches!(rows[2], Err(Error::MalformedTable(_))));
    }

    #[test]
    fn wrong_cell_count() {
        let table = test_table();
        let err = table.encode(["13,12,11", "1,2"], None).unwrap_err();
        assert!(matches!(err, Error::MalformedTable(_)));
    }

    #[test]
    fn size_is_upper_bound() {
        let table = test_table().with_size(8);
        assert_eq!(table.encode(["13,12,11", "1,2,3"], None).unwrap().len(), 8);
        assert!(matches!(
            table.encode(["13,12,11", "1,2,3", "4,5,6"], None),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn byte_array_columns_are_literal_text() {
        let table = TableDefinition::new(
            "names",
            vec![],
            vec![col("ID", "U8", ByteSpec::Unset), col("NAME", "U8[6]", ByteSpec::Unset)],
        )
        .unwrap()
        .with_delimiter("|");
        let encoded = table.encode(["1|ABC", "2|XYZW"], None).unwrap();
        assert_eq!(&encoded[..7], b"\x01ABC\0\0\0");

        let mut out = Vec::new();
        let rows = table.decode_file(encoded.as_slice(), &mut out, false).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(String::from_utf8(out).unwrap(), "1|ABC\n2|XYZW\n");
    }

    #[test]
    fn numeric_array_columns_round_trip() {
        let table = TableDefinition::new(
            "arrays",
            vec![],
            vec![col("ID", "U8", ByteSpec::Unset), col("V", "MSB_U16[2]", ByteSpec::Unset)],
        )
        .unwrap();
        let encoded = table.encode(["1, 1 2", "2,513  4"], None).unwrap();
        assert_eq!(encoded, [1, 0, 1, 0, 2, 2, 2, 1, 0, 4]);

        let mut out = Vec::new();
        assert_eq!(table.decode_file(encoded.as_slice(), &mut out, false).unwrap(), 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "1,1 2\n2,513 4\n");
        assert_eq!(table.encode(text.lines(), None).unwrap(), encoded);

        assert!(matches!(
            table.encode(["3,1 2 3"], None),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unprintable_byte_arrays_render_as_numbers() {
        let table = TableDefinition::new("raw", vec![], vec![col("B", "U8[3]", ByteSpec::Unset)]).unwrap();
        let encoded = table.encode(["1 0 200", "A"], None).unwrap();
        assert_eq!(encoded, [1, 0, 200, b'A', 0, 0]);

        let mut out = Vec::new();
        table.decode_file(encoded.as_slice(), &mut out, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "1 0 200\nA\n");
        assert_eq!(table.encode(text.lines(), None).unwrap(), encoded);
    }

    #[test]
    fn empty_input_has_no_rows() {
        let table = test_table();
        assert!(table.decode(&[], false).unwrap().is_empty());

        let header_only = table.decode(&[13, 12, 11], false).unwrap();
        assert_eq!(header_only, vec![[13, 12, 11].map(Value::Int).to_vec()]);
    }

    #[test]
    fn time_columns_use_rfc3339() {
        let table = TableDefinition::new("times", vec![], vec![col("T", "TIME32", ByteSpec::Unset)]).unwrap();
        let text = "2020-01-01T00:00:00.000000Z";
        let encoded = table.encode([text], None).unwrap();
        assert_eq!(encoded.len(), 4);

        let mut out = Vec::new();
        table.decode_file(encoded.as_slice(), &mut out, false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), text);
    }

    #[test]
    fn dictionary_rejects_duplicates() {
        let mut dict = TableDictionary::default();
        dict.add(test_table()).unwrap();
        assert!(dict.add(test_table()).is_err());
        assert_eq!(dict.get("test_type").unwrap().row_nbytes(), 5);
    }
}
