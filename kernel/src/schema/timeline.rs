// Schema Timeline
//
// Replays every schema change of a run into the catalog once, in commit
// order, and keeps each version of the tables a change touched. Streams
// are compacted in any order and in parallel, so a compactor looks its
// table up as of a commit ts instead of replaying DDL itself.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::ddl::Ddl;
use super::{CatalogError, SchemaCatalog, TableInfo};
use crate::log::{CommitTs, DdlRecord};

/// Structure of one table from a commit ts on; `None` while it does not exist.
type Version = (CommitTs, Option<Arc<TableInfo>>);

#[derive(Debug, Clone)]
struct Failure {
    statement: String,
    reason: String,
}

pub struct SchemaTimeline<'a> {
    catalog: &'a dyn SchemaCatalog,
    /// schema -> table -> versions, oldest first.
    versions: HashMap<String, HashMap<String, Vec<Version>>>,
    failures: HashMap<CommitTs, Failure>,
}

impl<'a> SchemaTimeline<'a> {
    /// Replay `changes` (in commit order) into `catalog`.
    ///
    /// Statements before `start_ts` only bring the catalog up to the start
    /// of the window; a rejected one is logged and skipped. Statements in
    /// the window are versioned, and a rejected one fails the streams that
    /// carry it.
    pub fn build(catalog: &'a dyn SchemaCatalog, changes: &[DdlRecord], start_ts: CommitTs) -> Self {
        let mut timeline = Self {
            catalog,
            versions: HashMap::new(),
            failures: HashMap::new(),
        };

        for ddl in changes {
            if ddl.commit_ts >= start_ts {
                timeline.replay(ddl);
                continue;
            }
            if let Err(err) = catalog.execute_ddl(&ddl.statement) {
                warn!(ddl = %ddl.statement, commit_ts = ddl.commit_ts, error = %err, "history ddl not applied");
            }
        }

        debug!(
            tables = timeline.versions.values().map(HashMap::len).sum::<usize>(),
            failures = timeline.failures.len(),
            "built schema timeline"
        );
        timeline
    }

    fn replay(&mut self, ddl: &DdlRecord) {
        let tables = match Ddl::parse(&ddl.statement).and_then(|parsed| parsed.tables()) {
            Ok(tables) => tables,
            Err(err) => return self.fail(ddl, &err),
        };

        for (schema, table) in &tables {
            let known = self
                .versions
                .get(schema)
                .is_some_and(|tables| tables.contains_key(table));
            if !known {
                let before = self.current(schema, table);
                self.versions
                    .entry(schema.clone())
                    .or_default()
                    .insert(table.clone(), vec![(CommitTs::MIN, before)]);
            }
        }

        if let Err(err) = self.catalog.execute_ddl(&ddl.statement) {
            return self.fail(ddl, &err);
        }

        for (schema, table) in tables {
            let after = self.current(&schema, &table);
            self.versions
                .entry(schema)
                .or_default()
                .entry(table)
                .or_default()
                .push((ddl.commit_ts, after));
        }
    }

    fn fail(&mut self, ddl: &DdlRecord, err: &CatalogError) {
        warn!(ddl = %ddl.statement, commit_ts = ddl.commit_ts, error = %err, "schema change not applied");
        self.failures.entry(ddl.commit_ts).or_insert_with(|| Failure {
            statement: ddl.statement.clone(),
            reason: err.to_string(),
        });
    }

    fn current(&self, schema: &str, table: &str) -> Option<Arc<TableInfo>> {
        self.catalog.table_info(schema, table).ok()
    }

    /// Structure of a table as of `commit_ts`.
    pub fn table_info(
        &self,
        schema: &str,
        table: &str,
        commit_ts: CommitTs,
    ) -> Result<Arc<TableInfo>, CatalogError> {
        let Some(versions) = self.versions.get(schema).and_then(|tables| tables.get(table)) else {
            // never changed in the window
            return self.catalog.table_info(schema, table);
        };

        let at = versions.partition_point(|(ts, _)| *ts <= commit_ts);
        versions[..at]
            .last()
            .and_then(|(_, info)| info.clone())
            .ok_or_else(|| CatalogError::TableNotExist {
                schema: schema.to_owned(),
                table: table.to_owned(),
            })
    }

    /// Fails when the schema change committed at `commit_ts` was rejected.
    pub fn check_replayed(&self, commit_ts: CommitTs) -> Result<(), CatalogError> {
        match self.failures.get(&commit_ts) {
            Some(failure) => Err(CatalogError::Replay {
                commit_ts,
                statement: failure.statement.clone(),
                reason: failure.reason.clone(),
            }),
            None => Ok(()),
        }
    }
}
