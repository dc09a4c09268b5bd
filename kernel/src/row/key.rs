// Row Key Derivation
//
// Builds the merge key that identifies one logical row across the
// mutations of a table: the primary key columns, else the first unique
// key, else every column, each formatted canonically and terminated by a
// separator.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::{decode_row, Column, ColumnDecoder, Image, MysqlType, RowError, Value};
use crate::schema::TableInfo;

/// Terminates every key segment.
pub const KEY_SEPARATOR: char = '|';

/// Decode a raw row and derive its key from the pre-image.
pub fn derive_key(
    decoder: &dyn ColumnDecoder,
    raw: &[Vec<u8>],
    info: &TableInfo,
) -> Result<(String, Vec<Column>), RowError> {
    let columns = decode_row(decoder, raw)?;
    let key = row_key(&columns, info, Image::Pre)?;
    Ok((key, columns))
}

/// Key of an already decoded row, read from the given image.
pub fn row_key(columns: &[Column], info: &TableInfo, image: Image) -> Result<String, RowError> {
    let by_name: HashMap<&str, &Column> = columns.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut key = String::new();
    for name in info.key_columns() {
        let column = by_name
            .get(name.as_str())
            .ok_or_else(|| RowError::SchemaMismatch {
                column: name.clone(),
            })?;
        push_value(&mut key, column.image(image), column.tp);
        key.push(KEY_SEPARATOR);
    }
    Ok(key)
}

/// Append the canonical text of `value` to `key`.
///
/// Equal logical values always produce equal text, whatever encoding the
/// log used for them. NULL contributes an empty segment.
fn push_value(key: &mut String, value: &Value, tp: MysqlType) {
    // Writing into a String cannot fail.
    let _ = match (tp, value) {
        (_, Value::Null) => Ok(()),
        (_, Value::Enum { code, .. }) => write!(key, "{code}"),
        (_, Value::Set { bits, .. }) => write!(key, "{bits}"),
        (_, Value::Bit(raw)) | (MysqlType::Bit, Value::Bytes(raw)) => {
            write!(key, "{}", bit_value(raw))
        }
        (_, Value::Int(v)) => write!(key, "{v}"),
        (_, Value::Uint(v)) => write!(key, "{v}"),
        (_, Value::Float(v)) => write!(key, "{v}"),
        (_, Value::Decimal(text)) => {
            push_escaped(key, &canonical_decimal(text));
            Ok(())
        }
        (tp, Value::Text(text)) if tp.is_decimal() => {
            push_escaped(key, &canonical_decimal(text));
            Ok(())
        }
        (_, Value::Text(text)) | (_, Value::Time(text)) => {
            push_escaped(key, text);
            Ok(())
        }
        (tp, Value::Bytes(raw)) if tp.is_decimal() => {
            push_escaped(key, &canonical_decimal(&String::from_utf8_lossy(raw)));
            Ok(())
        }
        (tp, Value::Bytes(raw)) if tp.is_textual() => {
            push_escaped(key, &String::from_utf8_lossy(raw));
            Ok(())
        }
        (_, Value::Bytes(raw)) => {
            raw.iter().try_for_each(|b| write!(key, "{b:02x}"))
        }
        (_, Value::Json(json)) => {
            push_escaped(key, &json.to_string());
            Ok(())
        }
    };
}

fn push_escaped(key: &mut String, text: &str) {
    for c in text.chars() {
        if c == KEY_SEPARATOR || c == '\\' {
            key.push('\\');
        }
        key.push(c);
    }
}

/// Bit values are stored big endian; only the low 64 bits are meaningful.
fn bit_value(raw: &[u8]) -> u64 {
    raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// `+007.50` and `7.5` are the same decimal.
fn canonical_decimal(text: &str) -> String {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let int_part = int_part.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let frac_part = frac_part.trim_end_matches('0');

    let mut out = String::with_capacity(digits.len() + 1);
    if negative && (int_part != "0" || !frac_part.is_empty()) {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    out
}
