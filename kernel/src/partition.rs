// Partitioner (Map Phase)
//
// Streams every input file once and routes its records into per-table
// working files. A table whose row events outgrow the memory budget is
// split into numbered passes so the reduce phase can hold one pass at a
// time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::filter::TableFilter;
use crate::log::files::is_acceptable;
use crate::log::{
    CommitTs, DdlRecord, DmlRecord, LogError, LogRecord, LogStore, LogWriter, RawEvent,
    RecordReader,
};
use crate::schema::ddl::route;

/// A logical output stream: one table, or the schema level statements of
/// one database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub schema: String,
    pub table: Option<String>,
}

impl StreamId {
    pub fn table(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: Some(table.into()),
        }
    }

    pub fn schema(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: None,
        }
    }

    /// Name of the working directory of this stream, unique per stream.
    pub fn work_dir_name(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", escape(&self.schema), escape(table)),
            None => escape(&self.schema),
        }
    }

    /// `root/<schema>/<table>`, or `root/<schema>` for schema streams.
    pub fn output_dir(&self, root: &Path) -> PathBuf {
        let dir = root.join(escape(&self.schema));
        match &self.table {
            Some(table) => dir.join(escape(table)),
            None => dir,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", self.schema, table),
            None => write!(f, "{}", self.schema),
        }
    }
}

/// Percent-escape everything but `[A-Za-z0-9_$-]` so any identifier is
/// a safe, unambiguous path component.
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'$' | b'-' => out.push(char::from(byte)),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Name of the `index`-th pass file of a stream.
pub fn pass_file_name(index: usize) -> String {
    format!("pass-{index:06}.log")
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: LogError,
    },

    #[error("failed to write working file of {stream}: {source}")]
    Write {
        stream: StreamId,
        #[source]
        source: LogError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub records_read: u64,
    /// Records or events outside the window, or filtered out.
    pub dropped: u64,
    /// DDL that names no table this run can track.
    pub skipped_ddl: u64,
    /// DDL committed before the window.
    pub history_ddl: u64,
}

/// Result of the map phase.
#[derive(Debug, Default)]
pub struct Partitions {
    /// Pass files of every stream, in production order.
    pub streams: BTreeMap<StreamId, Vec<PathBuf>>,
    /// Every routable DDL up to the end of the window, filtered tables
    /// included, in commit order. Replayed once into the catalog.
    pub schema_changes: Vec<DdlRecord>,
    pub stats: PartitionStats,
}

struct StreamWriter {
    dir: PathBuf,
    writer: Option<Box<dyn LogWriter>>,
    passes: Vec<PathBuf>,
    pass_bytes: u64,
    last_ts: CommitTs,
}

pub struct Partitioner<'a> {
    store: &'a dyn LogStore,
    filter: &'a TableFilter,
    work_dir: PathBuf,
    memory_budget: u64,
    start_ts: CommitTs,
    stop_ts: CommitTs,
    streams: BTreeMap<StreamId, StreamWriter>,
    schema_changes: Vec<DdlRecord>,
    stats: PartitionStats,
}

impl<'a> Partitioner<'a> {
    pub fn new(
        store: &'a dyn LogStore,
        filter: &'a TableFilter,
        work_dir: &Path,
        memory_budget: u64,
        start_ts: CommitTs,
        stop_ts: CommitTs,
    ) -> Self {
        Self {
            store,
            filter,
            work_dir: work_dir.to_path_buf(),
            memory_budget,
            start_ts,
            stop_ts,
            streams: BTreeMap::new(),
            schema_changes: Vec::new(),
            stats: PartitionStats::default(),
        }
    }

    /// Route every record of one input file.
    pub fn partition_file(&mut self, path: &Path) -> Result<(), PartitionError> {
        let read_err = |source| PartitionError::Read {
            path: path.to_path_buf(),
            source,
        };
        let reader = RecordReader::new(self.store.open_for_read(path).map_err(read_err)?);

        let before = self.stats.records_read;
        for record in reader {
            let record = record.map_err(read_err)?;
            self.stats.records_read += 1;
            match record {
                LogRecord::Ddl(ddl) => self.route_ddl(ddl)?,
                LogRecord::Dml(dml) => self.route_dml(dml)?,
            }
        }

        debug!(file = %path.display(), records = self.stats.records_read - before, "partitioned file");
        Ok(())
    }

    /// Collect the schema changes of a file that ends before the window.
    /// Its rows are counted as dropped without being routed.
    pub fn collect_history(&mut self, path: &Path) -> Result<(), PartitionError> {
        let read_err = |source| PartitionError::Read {
            path: path.to_path_buf(),
            source,
        };
        let reader = RecordReader::new(self.store.open_for_read(path).map_err(read_err)?);

        for record in reader {
            self.stats.records_read += 1;
            match record.map_err(read_err)? {
                LogRecord::Ddl(ddl) => self.route_ddl(ddl)?,
                LogRecord::Dml(_) => self.stats.dropped += 1,
            }
        }

        debug!(file = %path.display(), "collected schema history");
        Ok(())
    }

    fn route_ddl(&mut self, ddl: DdlRecord) -> Result<(), PartitionError> {
        if self.stop_ts != 0 && ddl.commit_ts > self.stop_ts {
            self.stats.dropped += 1;
            return Ok(());
        }

        let routes = match route(&ddl.statement) {
            Ok(routes) => routes,
            Err(err) => {
                warn!(ddl = %ddl.statement, commit_ts = ddl.commit_ts, error = %err, "skip ddl");
                self.stats.skipped_ddl += 1;
                return Ok(());
            }
        };

        let commit_ts = ddl.commit_ts;
        self.schema_changes.push(ddl);
        if commit_ts < self.start_ts {
            self.stats.history_ddl += 1;
            return Ok(());
        }

        for routed in routes {
            if !self.filter.allows(&routed.schema, routed.table.as_deref()) {
                self.stats.dropped += 1;
                continue;
            }
            let record = DdlRecord {
                commit_ts,
                statement: routed.statement,
            };
            let stream = StreamId {
                schema: routed.schema,
                table: routed.table,
            };
            self.append(stream, LogRecord::Ddl(record), false)?;
        }
        Ok(())
    }

    fn route_dml(&mut self, dml: DmlRecord) -> Result<(), PartitionError> {
        if !is_acceptable(dml.commit_ts, self.start_ts, self.stop_ts) {
            self.stats.dropped += 1;
            return Ok(());
        }

        // group by table, keeping the order of events within each table
        let mut tables: BTreeMap<StreamId, Vec<RawEvent>> = BTreeMap::new();
        for event in dml.events {
            if !self.filter.allows(&event.schema, Some(&event.table)) {
                self.stats.dropped += 1;
                continue;
            }
            tables
                .entry(StreamId::table(&event.schema, &event.table))
                .or_default()
                .push(event);
        }

        for (stream, events) in tables {
            let record = LogRecord::Dml(DmlRecord {
                commit_ts: dml.commit_ts,
                events,
            });
            self.append(stream, record, true)?;
        }
        Ok(())
    }

    /// Append a record to a stream, opening a new pass when the row events
    /// of the current one would exceed the memory budget.
    fn append(&mut self, stream: StreamId, record: LogRecord, counts: bool) -> Result<(), PartitionError> {
        let write_err = |stream: &StreamId, source| PartitionError::Write {
            stream: stream.clone(),
            source,
        };
        let payload = record.encode().map_err(|e| write_err(&stream, e))?;
        let size = payload.len() as u64;
        let commit_ts = record.commit_ts();

        let work_dir = &self.work_dir;
        let state = self.streams.entry(stream.clone()).or_insert_with(|| StreamWriter {
            dir: work_dir.join(stream.work_dir_name()),
            writer: None,
            passes: Vec::new(),
            pass_bytes: 0,
            last_ts: CommitTs::MIN,
        });

        if commit_ts < state.last_ts {
            warn!(%stream, commit_ts, previous = state.last_ts, "commit ts went backwards");
        }
        state.last_ts = state.last_ts.max(commit_ts);

        let full = counts && state.pass_bytes > 0 && state.pass_bytes + size > self.memory_budget;
        if full {
            if let Some(mut writer) = state.writer.take() {
                writer.close().map_err(|e| write_err(&stream, e))?;
            }
            debug!(%stream, pass = state.passes.len(), "memory budget reached, new pass");
        }

        let writer = match state.writer.take() {
            Some(writer) => writer,
            None => {
                let path = state.dir.join(pass_file_name(state.passes.len()));
                let writer = self
                    .store
                    .open_for_write(&path)
                    .map_err(|e| write_err(&stream, e))?;
                state.passes.push(path);
                state.pass_bytes = 0;
                writer
            }
        };
        let writer = state.writer.insert(writer);
        writer.write(&payload).map_err(|e| write_err(&stream, e))?;
        if counts {
            state.pass_bytes += size;
        }
        Ok(())
    }

    /// Close every working file and hand over the partitions.
    pub fn finish(self) -> Result<Partitions, PartitionError> {
        let mut streams = BTreeMap::new();
        for (stream, mut state) in self.streams {
            if let Some(mut writer) = state.writer.take() {
                writer.close().map_err(|source| PartitionError::Write {
                    stream: stream.clone(),
                    source,
                })?;
            }
            streams.insert(stream, state.passes);
        }

        let mut schema_changes = self.schema_changes;
        schema_changes.sort_by_key(|ddl| ddl.commit_ts);

        info!(
            streams = streams.len(),
            records = self.stats.records_read,
            dropped = self.stats.dropped,
            history = self.stats.history_ddl,
            schema_changes = schema_changes.len(),
            "partitioned input"
        );
        Ok(Partitions {
            streams,
            schema_changes,
            stats: self.stats,
        })
    }
}
