// Output Writer
//
// Serializes compacted records of one stream into its output log file.

use std::path::{Path, PathBuf};

use crate::compact::RecordSink;
use crate::log::files::log_file_name;
use crate::log::{LogError, LogRecord, LogStore, LogWriter};

pub struct TableWriter {
    path: PathBuf,
    writer: Box<dyn LogWriter>,
}

impl TableWriter {
    /// Open the first log file of `dir`, creating the directory.
    pub fn create(store: &dyn LogStore, dir: &Path) -> Result<Self, LogError> {
        let path = dir.join(log_file_name(0));
        let writer = store.open_for_write(&path)?;
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file, returning its path.
    pub fn close(mut self) -> Result<PathBuf, LogError> {
        self.writer.close()?;
        Ok(self.path)
    }
}

impl RecordSink for TableWriter {
    fn write_record(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let payload = record.encode()?;
        self.writer.write(&payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{DdlRecord, FileLogStore, RecordReader};

    #[test]
    fn records_are_readable_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TableWriter::create(&FileLogStore, &dir.path().join("s").join("t")).unwrap();
        assert!(writer.path().ends_with("s/t/binlog-0000000000000000"));

        for ts in [3, 4] {
            writer
                .write_record(&LogRecord::Ddl(DdlRecord {
                    commit_ts: ts,
                    statement: format!("create table s.t{ts} (a int)"),
                }))
                .unwrap();
        }
        let path = writer.close().unwrap();

        let stamps: Vec<_> = RecordReader::new(FileLogStore.open_for_read(&path).unwrap())
            .map(|r| r.unwrap().commit_ts())
            .collect();
        assert_eq!(stamps, vec![3, 4]);
    }
}
