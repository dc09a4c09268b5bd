// Input File Selection
//
// Finds the change log files of a directory and narrows them to the ones
// that can hold records of a commit-timestamp window.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{CommitTs, LogError, LogStore, RecordReader};

/// File name prefix of every change log file.
pub const LOG_FILE_PREFIX: &str = "binlog-";

/// Name of the `index`-th log file of a directory.
pub fn log_file_name(index: u64) -> String {
    format!("{LOG_FILE_PREFIX}{index:016}")
}

/// Whether a record falls inside `[start_ts, stop_ts]`; `stop_ts == 0` is unbounded.
pub fn is_acceptable(commit_ts: CommitTs, start_ts: CommitTs, stop_ts: CommitTs) -> bool {
    commit_ts >= start_ts && (stop_ts == 0 || commit_ts <= stop_ts)
}

/// Files picked for a run, ordered by their first commit timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSelection {
    pub files: Vec<PathBuf>,
    pub total_size: u64,
    /// Files that end before the window. Their rows are not needed, but
    /// their schema changes are.
    pub history_files: Vec<PathBuf>,
}

/// List the log files of `dir`, sorted by name.
pub fn search_files(dir: &Path) -> Result<Vec<PathBuf>, LogError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Keep the files whose records may fall in `[start_ts, stop_ts]`.
///
/// Files are ordered by the commit timestamp of their first record, so a
/// directory whose names do not follow commit order is still replayed in
/// commit order. A file is set aside as history when the next file already
/// starts at or before `start_ts`, and dropped when it starts after
/// `stop_ts`. Empty files are skipped.
pub fn filter_files(
    store: &dyn LogStore,
    files: Vec<PathBuf>,
    start_ts: CommitTs,
    stop_ts: CommitTs,
) -> Result<FileSelection, LogError> {
    let mut firsts = Vec::with_capacity(files.len());
    for file in files {
        let mut reader = RecordReader::new(store.open_for_read(&file)?);
        match reader.next_record()? {
            Some(record) => firsts.push((record.commit_ts(), file)),
            None => debug!(file = %file.display(), "skip empty log file"),
        }
    }
    firsts.sort();

    let mut selection = FileSelection::default();
    for (i, (first_ts, file)) in firsts.iter().enumerate() {
        if stop_ts != 0 && *first_ts > stop_ts {
            break;
        }
        if let Some((next_ts, _)) = firsts.get(i + 1) {
            if *next_ts <= start_ts {
                selection.history_files.push(file.clone());
                continue;
            }
        }
        selection.total_size += fs::metadata(file)?.len();
        selection.files.push(file.clone());
    }

    Ok(selection)
}
