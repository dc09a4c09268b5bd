// PITR Run
//
// Wires the phases together: select input files, partition them per
// table, replay every schema change once in commit order, compact every
// stream (in parallel across streams) and record the outcome in a manifest.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compact::{compact_stream, CompactError, CompactStats, TableCompactor};
use crate::config::{Config, ConfigError};
use crate::filter::{FilterError, TableFilter};
use crate::log::files::{filter_files, search_files, FileSelection};
use crate::log::{CommitTs, FileLogStore, LogError, LogStore};
use crate::partition::{PartitionError, PartitionStats, Partitioner, Partitions, StreamId};
use crate::row::{ColumnDecoder, JsonColumnDecoder};
use crate::schema::{CatalogError, MemoryCatalog, SchemaCatalog, SchemaTimeline};
use crate::writer::TableWriter;

/// File name of the run manifest inside the output directory.
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum PitrError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("schema catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("input selection: {0}")]
    Log(#[from] LogError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write manifest: {0}")]
    Manifest(#[source] serde_json::Error),

    #[error("stream {stream} failed: {source}")]
    Table {
        stream: StreamId,
        #[source]
        source: CompactError,
    },

    #[error("a compaction worker panicked")]
    WorkerPanicked,
}

/// Output of one compacted stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOutput {
    pub stream: StreamId,
    pub file: PathBuf,
    pub passes: usize,
    pub stats: CompactStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub stream: StreamId,
    pub error: String,
}

/// Summary of a run, written to `<output_dir>/manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: Uuid,
    pub start_ts: CommitTs,
    pub stop_ts: CommitTs,
    pub input_files: Vec<PathBuf>,
    pub input_bytes: u64,
    /// Files before the window, read for their schema changes only.
    pub history_files: Vec<PathBuf>,
    pub partition: PartitionStats,
    pub tables: Vec<TableOutput>,
    pub failed: Vec<TableFailure>,
    /// Streams never started because an earlier one failed.
    pub skipped: Vec<StreamId>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, PitrError> {
        let data = fs::read_to_string(path).map_err(|source| PitrError::Io {
            op: "failed to read",
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(PitrError::Manifest)
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

type Outcome = (StreamId, Result<TableOutput, CompactError>);

#[derive(Default)]
struct ReduceResult {
    outcomes: Vec<Outcome>,
    skipped: Vec<StreamId>,
}

pub struct Pitr {
    config: Config,
    store: Box<dyn LogStore>,
    decoder: Box<dyn ColumnDecoder>,
    catalog: Box<dyn SchemaCatalog>,
}

impl Pitr {
    /// A run over framed files, JSON columns and the in-memory catalog,
    /// bootstrapped from `history_ddl`.
    pub fn new(config: Config) -> Result<Self, PitrError> {
        config.validate()?;
        let catalog = MemoryCatalog::open(config.history_ddl.as_deref())?;
        Ok(Self::with_parts(config, FileLogStore, JsonColumnDecoder, catalog))
    }

    pub fn with_parts(
        config: Config,
        store: impl LogStore + 'static,
        decoder: impl ColumnDecoder + 'static,
        catalog: impl SchemaCatalog + 'static,
    ) -> Self {
        Self {
            config,
            store: Box::new(store),
            decoder: Box::new(decoder),
            catalog: Box::new(catalog),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the whole compaction.
    ///
    /// The manifest is written even when a stream fails; the first failure
    /// is then returned. Output of finished streams is left in place.
    pub fn process(&self) -> Result<Manifest, PitrError> {
        self.config.validate()?;
        let run_id = Uuid::new_v4();
        let config = &self.config;
        info!(%run_id, dir = %config.dir.display(), start_ts = config.start_ts, stop_ts = config.stop_ts, "pitr run started");

        let files = search_files(&config.dir)?;
        let selection = filter_files(self.store.as_ref(), files, config.start_ts, config.stop_ts)?;
        info!(
            files = selection.files.len(),
            bytes = selection.total_size,
            history_files = selection.history_files.len(),
            "selected input files"
        );

        let filter = TableFilter::new(&config.filter)?;
        let work_dir = config.temp_dir.join(run_id.to_string());
        create_dir(&work_dir)?;

        let result = self.map_reduce(&selection, &filter, &work_dir);
        if let Err(err) = fs::remove_dir_all(&work_dir) {
            warn!(dir = %work_dir.display(), error = %err, "failed to remove working files");
        }
        let (partition, reduced) = result?;

        let mut manifest = Manifest {
            run_id,
            start_ts: config.start_ts,
            stop_ts: config.stop_ts,
            input_files: selection.files,
            input_bytes: selection.total_size,
            history_files: selection.history_files,
            partition,
            tables: Vec::new(),
            failed: Vec::new(),
            skipped: reduced.skipped,
        };
        let mut first_failure = None;
        for (stream, outcome) in reduced.outcomes {
            match outcome {
                Ok(output) => manifest.tables.push(output),
                Err(err) => {
                    manifest.failed.push(TableFailure {
                        stream: stream.clone(),
                        error: err.to_string(),
                    });
                    first_failure.get_or_insert((stream, err));
                }
            }
        }

        self.write_manifest(&manifest)?;
        info!(
            %run_id,
            tables = manifest.tables.len(),
            failed = manifest.failed.len(),
            skipped = manifest.skipped.len(),
            "pitr run finished"
        );

        match first_failure {
            Some((stream, source)) => Err(PitrError::Table { stream, source }),
            None => Ok(manifest),
        }
    }

    fn map_reduce(
        &self,
        selection: &FileSelection,
        filter: &TableFilter,
        work_dir: &Path,
    ) -> Result<(PartitionStats, ReduceResult), PitrError> {
        let config = &self.config;
        let mut partitioner = Partitioner::new(
            self.store.as_ref(),
            filter,
            work_dir,
            config.memory_budget,
            config.start_ts,
            config.stop_ts,
        );
        for file in &selection.history_files {
            partitioner.collect_history(file)?;
        }
        for file in &selection.files {
            partitioner.partition_file(file)?;
        }
        let partitions = partitioner.finish()?;

        let schema = SchemaTimeline::build(self.catalog.as_ref(), &partitions.schema_changes, config.start_ts);

        create_dir(&config.output_dir)?;
        let reduced = self.reduce(&partitions, &schema)?;
        Ok((partitions.stats, reduced))
    }

    /// Compact every stream on `workers` threads.
    fn reduce(&self, partitions: &Partitions, schema: &SchemaTimeline<'_>) -> Result<ReduceResult, PitrError> {
        let (tx, rx) = flume::unbounded();
        for stream in &partitions.streams {
            // cannot fail while `rx` is alive
            let _ = tx.send(stream);
        }
        drop(tx);

        let failed = AtomicBool::new(false);
        let mut reduced = thread::scope(|scope| {
            let workers: Vec<_> = (0..self.config.workers)
                .map(|_| {
                    let rx = rx.clone();
                    let failed = &failed;
                    scope.spawn(move || {
                        let mut done = ReduceResult::default();
                        for (stream, passes) in rx.iter() {
                            if self.config.fail_fast && failed.load(Ordering::Relaxed) {
                                done.skipped.push(stream.clone());
                                continue;
                            }
                            let outcome = self.compact_table(schema, stream, passes);
                            if outcome.is_err() {
                                failed.store(true, Ordering::Relaxed);
                            }
                            done.outcomes.push((stream.clone(), outcome));
                        }
                        done
                    })
                })
                .collect();

            let mut reduced = ReduceResult::default();
            for worker in workers {
                let done = worker.join().map_err(|_| PitrError::WorkerPanicked)?;
                reduced.outcomes.extend(done.outcomes);
                reduced.skipped.extend(done.skipped);
            }
            Ok::<_, PitrError>(reduced)
        })?;

        reduced.outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        reduced.skipped.sort();
        Ok(reduced)
    }

    fn compact_table(
        &self,
        schema: &SchemaTimeline<'_>,
        stream: &StreamId,
        passes: &[PathBuf],
    ) -> Result<TableOutput, CompactError> {
        let dir = stream.output_dir(&self.config.output_dir);
        let writer = TableWriter::create(self.store.as_ref(), &dir)?;
        let mut compactor = TableCompactor::new(schema, self.decoder.as_ref(), writer);

        let result = compact_stream(self.store.as_ref(), passes, &mut compactor)
            .and_then(|()| compactor.finish());
        let (writer, stats) = match result {
            Ok(done) => done,
            Err(err) => {
                error!(%stream, error = %err, "stream compaction failed");
                return Err(err);
            }
        };
        let file = writer.close()?;

        info!(
            %stream,
            records = stats.records_out,
            events = stats.events_out,
            invalid = stats.invalid_transitions,
            "stream written"
        );
        Ok(TableOutput {
            stream: stream.clone(),
            file,
            passes: passes.len(),
            stats,
        })
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<(), PitrError> {
        let path = self.config.output_dir.join(MANIFEST_FILE);
        let data = serde_json::to_vec_pretty(manifest).map_err(PitrError::Manifest)?;
        fs::write(&path, data).map_err(|source| PitrError::Io {
            op: "failed to write",
            path,
            source,
        })
    }
}

fn create_dir(dir: &Path) -> Result<(), PitrError> {
    fs::create_dir_all(dir).map_err(|source| PitrError::Io {
        op: "failed to create",
        path: dir.to_path_buf(),
        source,
    })
}
