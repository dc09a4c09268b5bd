// Table Compactor (Reduce Phase)
//
// Replays the working files of one stream through the merge map and
// emits the net records. Pending events are flushed before every DDL at
// `ddl_ts - 1`, at the end of every pass, and once more at the end of
// the stream at the highest commit ts seen. Rows are keyed against the
// table structure as of their own commit ts.

use std::path::PathBuf;
use std::thread;

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::log::{CommitTs, DdlRecord, DmlRecord, LogError, LogRecord, LogStore, RecordReader};
use crate::merge::{EventMap, KeyConflict, MergedEvent};
use crate::row::{ColumnDecoder, RowError};
use crate::schema::{CatalogError, SchemaTimeline};

/// Maximum number of events in one output record.
pub const FLUSH_BATCH_SIZE: usize = 1000;

/// Records read ahead of the compactor.
pub const READ_AHEAD: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Row(#[from] RowError),

    #[error(transparent)]
    KeyConflict(#[from] KeyConflict),
}

/// Destination of compacted records.
pub trait RecordSink {
    fn write_record(&mut self, record: &LogRecord) -> Result<(), LogError>;
}

impl RecordSink for Vec<LogRecord> {
    fn write_record(&mut self, record: &LogRecord) -> Result<(), LogError> {
        self.push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactStats {
    pub records_in: u64,
    pub events_in: u64,
    pub records_out: u64,
    pub events_out: u64,
    pub ddl: u64,
    pub invalid_transitions: u64,
}

/// Compacts one stream. Owns the merge map; never shared across threads.
pub struct TableCompactor<'a, S: RecordSink> {
    schema: &'a SchemaTimeline<'a>,
    decoder: &'a dyn ColumnDecoder,
    sink: S,
    map: EventMap,
    max_ts: Option<CommitTs>,
    stats: CompactStats,
}

impl<'a, S: RecordSink> TableCompactor<'a, S> {
    pub fn new(schema: &'a SchemaTimeline<'a>, decoder: &'a dyn ColumnDecoder, sink: S) -> Self {
        Self {
            schema,
            decoder,
            sink,
            map: EventMap::new(),
            max_ts: None,
            stats: CompactStats::default(),
        }
    }

    pub fn apply(&mut self, record: LogRecord) -> Result<(), CompactError> {
        let commit_ts = record.commit_ts();
        self.stats.records_in += 1;

        match record {
            LogRecord::Ddl(ddl) => self.apply_ddl(ddl)?,
            LogRecord::Dml(dml) => {
                for event in &dml.events {
                    let info = self.schema.table_info(&event.schema, &event.table, commit_ts)?;
                    let merged = MergedEvent::from_raw(event, self.decoder, &info)?;
                    self.map.apply(merged)?;
                    self.stats.events_in += 1;
                }
            }
        }

        self.max_ts = Some(self.max_ts.map_or(commit_ts, |ts| ts.max(commit_ts)));
        Ok(())
    }

    /// Flush what is pending and pass the DDL through. The change itself
    /// was replayed into the timeline before compaction started.
    fn apply_ddl(&mut self, ddl: DdlRecord) -> Result<(), CompactError> {
        self.flush(ddl.commit_ts.saturating_sub(1))?;
        self.schema.check_replayed(ddl.commit_ts)?;

        self.sink.write_record(&LogRecord::Ddl(ddl))?;
        self.stats.records_out += 1;
        self.stats.ddl += 1;
        Ok(())
    }

    /// Flush at the end of a working file pass.
    pub fn end_pass(&mut self) -> Result<(), CompactError> {
        match self.max_ts {
            Some(ts) => self.flush(ts),
            None => Ok(()),
        }
    }

    /// Flush the remaining events and hand back the sink.
    pub fn finish(mut self) -> Result<(S, CompactStats), CompactError> {
        self.end_pass()?;
        self.stats.invalid_transitions = self.map.invalid_transitions();
        Ok((self.sink, self.stats))
    }

    /// Write every pending event at `commit_ts`, in batches.
    fn flush(&mut self, commit_ts: CommitTs) -> Result<(), CompactError> {
        if self.map.is_empty() {
            return Ok(());
        }

        let events = self.map.drain();
        for batch in events.chunks(FLUSH_BATCH_SIZE) {
            let raw = batch
                .iter()
                .map(|event| event.to_raw(self.decoder))
                .collect::<Result<Vec<_>, _>>()?;
            let count = raw.len() as u64;
            self.sink.write_record(&LogRecord::Dml(DmlRecord {
                commit_ts,
                events: raw,
            }))?;
            self.stats.records_out += 1;
            self.stats.events_out += count;
        }

        debug!(commit_ts, events = events.len(), "flushed pending events");
        Ok(())
    }

    pub fn stats(&self) -> &CompactStats {
        &self.stats
    }
}

enum Feed {
    Record(LogRecord),
    EndOfPass,
    Failed(LogError),
}

/// Compact the pass files of one stream, in order.
///
/// A reader thread decodes the files into a bounded queue; the calling
/// thread merges.
pub fn compact_stream<S: RecordSink>(
    store: &dyn LogStore,
    passes: &[PathBuf],
    compactor: &mut TableCompactor<'_, S>,
) -> Result<(), CompactError> {
    let (tx, rx) = flume::bounded(READ_AHEAD);
    thread::scope(|scope| {
        scope.spawn(move || read_passes(store, passes, tx));
        consume(rx, compactor)
    })?;

    info!(
        passes = passes.len(),
        records = compactor.stats().records_in,
        events = compactor.stats().events_in,
        "compacted stream"
    );
    Ok(())
}

fn read_passes(store: &dyn LogStore, passes: &[PathBuf], tx: Sender<Feed>) {
    for pass in passes {
        let reader = match store.open_for_read(pass) {
            Ok(reader) => RecordReader::new(reader),
            Err(err) => {
                let _ = tx.send(Feed::Failed(err));
                return;
            }
        };
        for record in reader {
            let feed = match record {
                Ok(record) => Feed::Record(record),
                Err(err) => {
                    let _ = tx.send(Feed::Failed(err));
                    return;
                }
            };
            // the consumer hung up after an error
            if tx.send(feed).is_err() {
                return;
            }
        }
        if tx.send(Feed::EndOfPass).is_err() {
            return;
        }
    }
}

fn consume<S: RecordSink>(
    rx: Receiver<Feed>,
    compactor: &mut TableCompactor<'_, S>,
) -> Result<(), CompactError> {
    for feed in rx.iter() {
        match feed {
            Feed::Record(record) => compactor.apply(record)?,
            Feed::EndOfPass => compactor.end_pass()?,
            Feed::Failed(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EventKind, FileLogStore, RawEvent};
    use crate::row::{Column, JsonColumnDecoder, MysqlType, Value};
    use crate::schema::{MemoryCatalog, SchemaCatalog};

    fn catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        catalog
            .execute_ddl("create table s.t (a int primary key, b int)")
            .unwrap();
        catalog
    }

    fn raw(kind: EventKind, a: (i64, Option<i64>), b: (i64, Option<i64>)) -> RawEvent {
        let column = |name: &str, (value, changed): (i64, Option<i64>)| {
            JsonColumnDecoder
                .encode(&Column {
                    name: name.into(),
                    tp: MysqlType::Long,
                    value: Value::Int(value),
                    changed_value: changed.map(Value::Int),
                })
                .unwrap()
        };
        RawEvent {
            schema: "s".into(),
            table: "t".into(),
            kind,
            columns: vec![column("a", a), column("b", b)],
        }
    }

    fn dml(commit_ts: CommitTs, events: Vec<RawEvent>) -> LogRecord {
        LogRecord::Dml(DmlRecord { commit_ts, events })
    }

    fn ddl(commit_ts: CommitTs, statement: &str) -> LogRecord {
        LogRecord::Ddl(DdlRecord {
            commit_ts,
            statement: statement.into(),
        })
    }

    /// Replay the DDL among `records` into a timeline over `catalog`.
    fn timeline<'a>(catalog: &'a MemoryCatalog, records: &[LogRecord]) -> SchemaTimeline<'a> {
        let changes: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                LogRecord::Ddl(d) => Some(d.clone()),
                LogRecord::Dml(_) => None,
            })
            .collect();
        SchemaTimeline::build(catalog, &changes, 0)
    }

    fn run(catalog: &MemoryCatalog, records: Vec<LogRecord>) -> (Vec<LogRecord>, CompactStats) {
        let schema = timeline(catalog, &records);
        let mut compactor = TableCompactor::new(&schema, &JsonColumnDecoder, Vec::new());
        for record in records {
            compactor.apply(record).unwrap();
        }
        compactor.finish().unwrap()
    }

    #[test]
    fn ddl_splits_pending_events() {
        let catalog = catalog();
        let (out, stats) = run(
            &catalog,
            vec![
                dml(5, vec![raw(EventKind::Insert, (1, None), (0, None))]),
                dml(7, vec![raw(EventKind::Insert, (2, None), (0, None))]),
                ddl(10, "alter table s.t add column c int"),
                dml(15, vec![raw(EventKind::Insert, (3, None), (0, None))]),
            ],
        );

        let shape: Vec<_> = out
            .iter()
            .map(|r| match r {
                LogRecord::Ddl(d) => (d.commit_ts, 0),
                LogRecord::Dml(d) => (d.commit_ts, d.events.len()),
            })
            .collect();
        assert_eq!(shape, vec![(9, 2), (10, 0), (15, 1)]);
        assert_eq!(stats.ddl, 1);
        assert_eq!(stats.events_out, 3);
        assert_eq!(catalog.table_info("s", "t").unwrap().columns.len(), 3);
    }

    #[test]
    fn flush_batches_by_thousand() {
        let catalog = catalog();
        let events = (0..2500)
            .map(|a| raw(EventKind::Insert, (a, None), (0, None)))
            .collect();
        let (out, stats) = run(&catalog, vec![dml(1, events)]);

        let sizes: Vec<_> = out
            .iter()
            .map(|r| match r {
                LogRecord::Dml(d) => d.events.len(),
                LogRecord::Ddl(_) => 0,
            })
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(stats.records_out, 3);
    }

    #[test]
    fn invalid_transitions_are_counted() {
        let catalog = catalog();
        let (out, stats) = run(
            &catalog,
            vec![
                dml(1, vec![raw(EventKind::Insert, (1, None), (0, None))]),
                dml(2, vec![raw(EventKind::Insert, (1, None), (5, None))]),
            ],
        );
        assert_eq!(stats.invalid_transitions, 1);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn unknown_table_fails() {
        let catalog = MemoryCatalog::new();
        let schema = SchemaTimeline::build(&catalog, &[], 0);
        let mut compactor = TableCompactor::new(&schema, &JsonColumnDecoder, Vec::new());
        let err = compactor
            .apply(dml(1, vec![raw(EventKind::Insert, (1, None), (0, None))]))
            .unwrap_err();
        assert!(matches!(err, CompactError::Catalog(CatalogError::TableNotExist { .. })));
    }

    #[test]
    fn row_missing_a_key_column_aborts() {
        let catalog = catalog();
        let schema = SchemaTimeline::build(&catalog, &[], 0);
        let mut compactor = TableCompactor::new(&schema, &JsonColumnDecoder, Vec::new());
        let mut event = raw(EventKind::Insert, (1, None), (0, None));
        // keep only column b
        event.columns.remove(0);

        let err = compactor.apply(dml(1, vec![event])).unwrap_err();
        assert!(matches!(err, CompactError::Row(RowError::SchemaMismatch { ref column }) if column == "a"));
    }

    #[test]
    fn rows_are_keyed_by_the_structure_of_their_commit() {
        let catalog = catalog();
        let records = vec![
            dml(1, vec![raw(EventKind::Insert, (1, None), (0, None))]),
            ddl(5, "alter table s.t drop primary key"),
            // without a key both columns identify the row
            dml(6, vec![raw(EventKind::Insert, (2, None), (0, None))]),
            dml(7, vec![raw(EventKind::Insert, (2, None), (3, None))]),
        ];
        let (out, stats) = run(&catalog, records);

        assert_eq!(stats.invalid_transitions, 0);
        let sizes: Vec<_> = out
            .iter()
            .map(|r| match r {
                LogRecord::Dml(d) => (d.commit_ts, d.events.len()),
                LogRecord::Ddl(d) => (d.commit_ts, 0),
            })
            .collect();
        assert_eq!(sizes, vec![(4, 1), (5, 0), (7, 2)]);
    }

    #[test]
    fn rejected_schema_change_aborts_at_its_boundary() {
        let catalog = catalog();
        let records = vec![
            dml(1, vec![raw(EventKind::Insert, (1, None), (0, None))]),
            ddl(5, "alter table s.t drop column nope"),
        ];
        let schema = timeline(&catalog, &records);
        let mut compactor = TableCompactor::new(&schema, &JsonColumnDecoder, Vec::new());

        let mut records = records.into_iter();
        compactor.apply(records.next().unwrap()).unwrap();
        let err = compactor.apply(records.next().unwrap()).unwrap_err();
        assert!(matches!(err, CompactError::Catalog(CatalogError::Replay { commit_ts: 5, .. })));
        // rows before the change were still flushed
        assert_eq!(compactor.stats().records_out, 1);
    }

    #[test]
    fn stream_is_flushed_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        let passes: Vec<_> = [
            vec![dml(1, vec![raw(EventKind::Insert, (1, None), (0, None))])],
            vec![dml(2, vec![raw(EventKind::Update, (1, Some(1)), (0, Some(4)))])],
        ]
        .into_iter()
        .enumerate()
        .map(|(i, records)| {
            let path = dir.path().join(crate::partition::pass_file_name(i));
            let mut writer = FileLogStore.open_for_write(&path).unwrap();
            for record in records {
                writer.write(&record.encode().unwrap()).unwrap();
            }
            writer.close().unwrap();
            path
        })
        .collect();

        let catalog = catalog();
        let schema = SchemaTimeline::build(&catalog, &[], 0);
        let mut compactor = TableCompactor::new(&schema, &JsonColumnDecoder, Vec::new());
        compact_stream(&FileLogStore, &passes, &mut compactor).unwrap();
        let (out, _) = compactor.finish().unwrap();

        // the insert is flushed with the first pass; the update follows
        let kinds: Vec<_> = out
            .iter()
            .map(|r| match r {
                LogRecord::Dml(d) => (d.commit_ts, d.events[0].kind),
                LogRecord::Ddl(_) => panic!("unexpected ddl"),
            })
            .collect();
        assert_eq!(kinds, vec![(1, EventKind::Insert), (2, EventKind::Update)]);
    }

    #[test]
    fn corrupt_pass_aborts_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::partition::pass_file_name(0));
        std::fs::write(&path, b"not a frame at all").unwrap();

        let catalog = catalog();
        let schema = SchemaTimeline::build(&catalog, &[], 0);
        let mut compactor = TableCompactor::new(&schema, &JsonColumnDecoder, Vec::new());
        let err = compact_stream(&FileLogStore, &[path], &mut compactor).unwrap_err();
        assert!(matches!(err, CompactError::Log(LogError::Corrupt { .. })));
    }
}
