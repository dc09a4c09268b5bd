// Change Log Records
//
// The unit of both the input and the output log: either a schema change
// (DDL) or a batch of row mutations (DML), stamped with the commit
// timestamp that orders the whole stream.

pub mod files;
pub mod store;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use store::{FileLogStore, LogReader, LogStore, LogWriter};

/// Commit timestamp of a record. The only ordering key of the log.
pub type CommitTs = i64;

/// Kind of a row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// One row mutation as it appears in the source log.
///
/// Every column is kept in its raw encoding; see [`crate::row::ColumnDecoder`].
/// Update columns carry both images, Insert and Delete only one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub schema: String,
    pub table: String,
    pub kind: EventKind,
    pub columns: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlRecord {
    pub commit_ts: CommitTs,
    pub statement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmlRecord {
    pub commit_ts: CommitTs,
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    Ddl(DdlRecord),
    Dml(DmlRecord),
}

impl LogRecord {
    pub fn commit_ts(&self) -> CommitTs {
        match self {
            LogRecord::Ddl(ddl) => ddl.commit_ts,
            LogRecord::Dml(dml) => dml.commit_ts,
        }
    }

    /// Serialize the record into a frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        serde_json::to_vec(self).map_err(LogError::Encode)
    }

    /// Parse a record from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, LogError> {
        serde_json::from_slice(payload).map_err(LogError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: &'static str },

    #[error("malformed log record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode log record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Decodes the frames of one log file into records, in file order.
pub struct RecordReader {
    reader: Box<dyn LogReader>,
}

impl RecordReader {
    pub fn new(reader: Box<dyn LogReader>) -> Self {
        Self { reader }
    }

    /// Next record, or `None` at a clean end of log.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, LogError> {
        match self.reader.next_frame()? {
            Some(payload) => LogRecord::decode(&payload).map(Some),
            None => Ok(None),
        }
    }
}

impl Iterator for RecordReader {
    type Item = Result<LogRecord, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dml_record_keeps_event_order() {
        let record = LogRecord::Dml(DmlRecord {
            commit_ts: 42,
            events: vec![
                RawEvent {
                    schema: "test".into(),
                    table: "t".into(),
                    kind: EventKind::Insert,
                    columns: vec![b"a".to_vec()],
                },
                RawEvent {
                    schema: "test".into(),
                    table: "t".into(),
                    kind: EventKind::Delete,
                    columns: vec![b"b".to_vec()],
                },
            ],
        });

        let decoded = LogRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded.commit_ts(), 42);
        let LogRecord::Dml(dml) = decoded else {
            panic!("expected a dml record");
        };
        assert_eq!(dml.events[0].kind, EventKind::Insert);
        assert_eq!(dml.events[1].kind, EventKind::Delete);
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = LogRecord::decode(b"{\"type\":\"ddl\"").unwrap_err();
        assert!(matches!(err, LogError::Decode(_)));
    }
}
