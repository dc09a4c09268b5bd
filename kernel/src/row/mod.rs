// Row Columns
//
// Typed view of the raw column encodings carried by row events, and the
// decoder contract that produces it.

pub mod key;

use serde::{Deserialize, Serialize};

/// MySQL column type of a column, as recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MysqlType {
    Tiny,
    Short,
    Int24,
    Long,
    LongLong,
    Year,
    Float,
    Double,
    Decimal,
    NewDecimal,
    Date,
    NewDate,
    Datetime,
    Timestamp,
    Duration,
    Varchar,
    VarString,
    String,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    Json,
    Enum,
    Set,
    Bit,
    Geometry,
    Null,
}

impl MysqlType {
    /// Types whose byte values are text rather than opaque binary.
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            MysqlType::Varchar
                | MysqlType::VarString
                | MysqlType::String
                | MysqlType::Json
                | MysqlType::Date
                | MysqlType::NewDate
                | MysqlType::Datetime
                | MysqlType::Timestamp
                | MysqlType::Duration
                | MysqlType::Decimal
                | MysqlType::NewDecimal
        )
    }

    pub fn is_decimal(self) -> bool {
        matches!(self, MysqlType::Decimal | MysqlType::NewDecimal)
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "v", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Uint(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    Decimal(String),
    Time(String),
    Enum { name: String, code: u64 },
    Set { names: String, bits: u64 },
    Bit(Vec<u8>),
    Json(serde_json::Value),
}

/// Which image of a row to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Image {
    /// The row before the mutation (the only image of Insert and Delete).
    Pre,
    /// The row after an Update.
    Post,
}

/// One column of a row event.
///
/// `value` is the pre-image (the only image for Insert/Delete);
/// `changed_value` is the post-image of an Update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub tp: MysqlType,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_value: Option<Value>,
}

impl Column {
    pub fn image(&self, image: Image) -> &Value {
        match image {
            Image::Pre => &self.value,
            Image::Post => self.changed_value.as_ref().unwrap_or(&self.value),
        }
    }

    /// This column reduced to a single image.
    pub fn settled(&self, image: Image) -> Column {
        Column {
            name: self.name.clone(),
            tp: self.tp,
            value: self.image(image).clone(),
            changed_value: None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RowError {
    #[error("malformed column: {0}")]
    Decode(String),

    #[error("failed to encode column `{column}`: {reason}")]
    Encode { column: String, reason: String },

    #[error("schema mismatch: key column `{column}` missing from row")]
    SchemaMismatch { column: String },
}

/// Converts between raw column encodings and [`Column`]s.
pub trait ColumnDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Column, RowError>;

    /// Inverse of [`ColumnDecoder::decode`], used when writing merged rows back out.
    fn encode(&self, column: &Column) -> Result<Vec<u8>, RowError>;
}

/// Decode every raw column of a row, keeping their order.
pub fn decode_row(decoder: &dyn ColumnDecoder, raw: &[Vec<u8>]) -> Result<Vec<Column>, RowError> {
    raw.iter().map(|bytes| decoder.decode(bytes)).collect()
}

/// Columns encoded as JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonColumnDecoder;

impl ColumnDecoder for JsonColumnDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Column, RowError> {
        serde_json::from_slice(raw).map_err(|err| RowError::Decode(err.to_string()))
    }

    fn encode(&self, column: &Column) -> Result<Vec<u8>, RowError> {
        serde_json::to_vec(column).map_err(|err| RowError::Encode {
            column: column.name.clone(),
            reason: err.to_string(),
        })
    }
}
