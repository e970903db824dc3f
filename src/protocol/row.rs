//! Row codec: NULL-bitmask framing plus per-type textual transcoding.
//!
//! A row travels as `(nulls_bitmask, values[])` in relation column order.
//! Bit `i` of the bitmask (MSB-first within each byte) is set iff column
//! `i` is NULL; the bitmask is padded with zeros on the right to a whole
//! byte. An empty byte-string with its bit clear is the literal empty
//! value - distinguishing NULL from empty requires the bitmask.
//!
//! Encode and decode share one bitmask primitive so the two directions
//! cannot drift.

use bytes::Bytes;

use crate::error::{Result, SatError};
use crate::protocol::messages::SatOpRow;
use crate::relation::Column;
use crate::txn::RowMap;

/// Well-known PostgreSQL column types with dedicated transcoding. Anything
/// else is passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgColumnType {
    Bytea,
    Text,
    Varchar,
    Int2,
    Int4,
    Int8,
    Float8,
    Uuid,
    Timestamp,
    TimestampTz,
    Other,
}

impl PgColumnType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "bytea" => PgColumnType::Bytea,
            "text" => PgColumnType::Text,
            "varchar" | "character varying" => PgColumnType::Varchar,
            "int2" | "smallint" => PgColumnType::Int2,
            "int4" | "integer" | "int" => PgColumnType::Int4,
            "int8" | "bigint" => PgColumnType::Int8,
            "float8" | "double precision" => PgColumnType::Float8,
            "uuid" => PgColumnType::Uuid,
            "timestamp" => PgColumnType::Timestamp,
            "timestamptz" | "timestamp with time zone" => PgColumnType::TimestampTz,
            _ => PgColumnType::Other,
        }
    }
}

fn mask_len(columns: usize) -> usize {
    columns.div_ceil(8)
}

fn set_null_bit(mask: &mut [u8], i: usize) {
    mask[i / 8] |= 0x80 >> (i % 8);
}

fn null_bit(mask: &[u8], i: usize) -> bool {
    mask[i / 8] & (0x80 >> (i % 8)) != 0
}

/// Normalizes a `timestamptz` textual value: a trailing `±HH` offset gains
/// `:00`; `±HH:MM` is left as-is. Some client SQL engines do not accept
/// the short form.
fn normalize_timestamptz(value: &str) -> String {
    // Offsets start after the time part; skip the date's own dashes.
    if let Some(idx) = value.rfind(['+', '-']) {
        if idx > 10 {
            let offset = &value[idx + 1..];
            if offset.len() == 2 && offset.bytes().all(|b| b.is_ascii_digit()) {
                return format!("{value}:00");
            }
        }
    }
    value.to_string()
}

/// Per-type textual encoding, source value to wire bytes.
fn encode_value(ty: PgColumnType, value: &str) -> Bytes {
    match ty {
        PgColumnType::TimestampTz => Bytes::from(normalize_timestamptz(value)),
        _ => Bytes::copy_from_slice(value.as_bytes()),
    }
}

/// Per-type decode validation, wire bytes to textual value.
fn decode_value(ty: PgColumnType, column: &str, raw: &Bytes) -> Result<String> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| SatError::InvalidRow(format!("column {column}: value is not valid utf-8")))?;
    match ty {
        PgColumnType::Int2 => {
            text.parse::<i16>().map_err(|_| {
                SatError::InvalidRow(format!("column {column}: {text:?} out of int2 range"))
            })?;
        }
        PgColumnType::Int4 => {
            text.parse::<i32>().map_err(|_| {
                SatError::InvalidRow(format!("column {column}: {text:?} out of int4 range"))
            })?;
        }
        PgColumnType::Int8 => {
            text.parse::<i64>().map_err(|_| {
                SatError::InvalidRow(format!("column {column}: {text:?} out of int8 range"))
            })?;
        }
        PgColumnType::Float8 => {
            text.parse::<f64>().map_err(|_| {
                SatError::InvalidRow(format!("column {column}: {text:?} is not a float8"))
            })?;
        }
        PgColumnType::Uuid => {
            if !is_canonical_uuid(text) {
                return Err(SatError::InvalidRow(format!(
                    "column {column}: {text:?} is not a canonical uuid"
                )));
            }
        }
        _ => {}
    }
    Ok(text.to_string())
}

/// Canonical form: 8-4-4-4-12 hex groups separated by hyphens.
fn is_canonical_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

/// Encodes a row image against an ordered column schema.
///
/// Columns absent from the map encode as NULL.
pub fn encode_row(row: &RowMap, columns: &[Column]) -> SatOpRow {
    let mut mask = vec![0u8; mask_len(columns.len())];
    let mut values = Vec::with_capacity(columns.len());

    for (i, col) in columns.iter().enumerate() {
        match row.get(&col.name) {
            Some(Some(value)) => {
                values.push(encode_value(PgColumnType::from_name(&col.pg_type), value));
            }
            Some(None) | None => {
                set_null_bit(&mut mask, i);
                values.push(Bytes::new());
            }
        }
    }

    SatOpRow {
        nulls_bitmask: Bytes::from(mask),
        values,
    }
}

/// Decodes a wire row against the column schema it was encoded with.
pub fn decode_row(row: &SatOpRow, columns: &[Column]) -> Result<RowMap> {
    if row.values.len() != columns.len() {
        return Err(SatError::InvalidRow(format!(
            "row has {} values for {} columns",
            row.values.len(),
            columns.len()
        )));
    }
    if row.nulls_bitmask.len() != mask_len(columns.len()) {
        return Err(SatError::InvalidRow(format!(
            "bitmask is {} bytes for {} columns",
            row.nulls_bitmask.len(),
            columns.len()
        )));
    }

    let mut map = RowMap::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        if null_bit(&row.nulls_bitmask, i) {
            if !row.values[i].is_empty() {
                return Err(SatError::Protocol(format!(
                    "column {}: non-empty value with null bit set",
                    col.name
                )));
            }
            map.insert(col.name.clone(), None);
        } else {
            let value = decode_value(
                PgColumnType::from_name(&col.pg_type),
                &col.name,
                &row.values[i],
            )?;
            map.insert(col.name.clone(), Some(value));
        }
    }
    Ok(map)
}
