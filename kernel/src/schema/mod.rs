// Schema Catalog
//
// Tracks the structure of every table (non-generated columns, primary
// key, unique keys) as DDL is replayed, so row keys are always derived
// against the table layout that was current when the row was written.

pub mod ddl;
pub mod timeline;

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::log::CommitTs;
use ddl::{AlterSpec, ColumnDef, Ddl, IndexDef, Position, Statement};

pub use timeline::SchemaTimeline;

/// Name of the primary key index.
pub const PRIMARY_KEY_NAME: &str = "PRIMARY";

/// Attempts made to set up a catalog before giving up.
pub const SETUP_ATTEMPTS: u32 = 5;

/// Delay before the first setup retry; doubled on every further attempt.
pub const SETUP_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
}

/// Structure of one table as far as key derivation is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Non-generated columns, in declaration order.
    pub columns: Vec<String>,
    pub primary_key: Option<IndexInfo>,
    /// Unique keys other than the primary key, in declaration order.
    pub unique_keys: Vec<IndexInfo>,
}

impl TableInfo {
    /// Columns identifying a row: the primary key, else the first unique
    /// key, else the whole row.
    pub fn key_columns(&self) -> &[String] {
        self.primary_key
            .as_ref()
            .or_else(|| self.unique_keys.first())
            .map(|index| index.columns.as_slice())
            .unwrap_or(&self.columns)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("table `{schema}`.`{table}` not exist")]
    TableNotExist { schema: String, table: String },

    #[error("table `{schema}`.`{table}` not found")]
    TableNotFound { schema: String, table: String },

    #[error("invalid ddl `{statement}`: {reason}")]
    InvalidDdl { statement: String, reason: String },

    #[error("schema change `{statement}` at {commit_ts} was not applied: {reason}")]
    Replay {
        commit_ts: CommitTs,
        statement: String,
        reason: String,
    },

    #[error("failed to read schema history {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed schema history {}: {source}", path.display())]
    History {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Resolves table structure and replays schema changes.
///
/// Shared by every table compactor of a run: implementations must
/// serialise `execute_ddl` against concurrent `table_info` calls.
pub trait SchemaCatalog: Send + Sync {
    /// Replay one DDL text, updating the tables it touches.
    fn execute_ddl(&self, statement: &str) -> Result<(), CatalogError>;

    /// Current structure of a table.
    fn table_info(&self, schema: &str, table: &str) -> Result<Arc<TableInfo>, CatalogError>;
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `attempts` runs out, sleeping `backoff` (doubling) in between.
pub fn retry_with_backoff<T, E: Display>(
    attempts: u32,
    backoff: Duration,
    retryable: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && retryable(&err) => {
                warn!(attempt, error = %err, "catalog setup failed, retrying");
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TableDef {
    columns: Vec<ColumnDef>,
    /// Every index, named; non-unique ones are kept so they can be dropped.
    indexes: Vec<IndexDef>,
}

impl TableDef {
    fn create(columns: Vec<ColumnDef>, indexes: Vec<IndexDef>) -> Result<Self, String> {
        let mut def = TableDef::default();
        for column in columns {
            def.add_column(column, &Position::Last)?;
        }
        for index in indexes {
            def.add_index(index)?;
        }
        Ok(def)
    }

    fn column_position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn index_position(&self, name: &str) -> Option<usize> {
        self.indexes
            .iter()
            .position(|i| i.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
    }

    fn insert_column(&mut self, column: ColumnDef, position: &Position) -> Result<(), String> {
        let at = match position {
            Position::Last => self.columns.len(),
            Position::First => 0,
            Position::After(after) => {
                self.column_position(after)
                    .ok_or_else(|| format!("unknown column `{after}`"))?
                    + 1
            }
        };
        self.columns.insert(at, column);
        Ok(())
    }

    fn add_column(&mut self, column: ColumnDef, position: &Position) -> Result<(), String> {
        if self.column_position(&column.name).is_some() {
            return Err(format!("duplicate column `{}`", column.name));
        }
        let inline = inline_index(&column);
        self.insert_column(column, position)?;
        if let Some(index) = inline {
            self.add_index(index)?;
        }
        Ok(())
    }

    fn drop_column(&mut self, name: &str) -> Result<(), String> {
        let at = self
            .column_position(name)
            .ok_or_else(|| format!("unknown column `{name}`"))?;
        self.columns.remove(at);
        for index in &mut self.indexes {
            index.columns.retain(|c| !c.eq_ignore_ascii_case(name));
        }
        self.indexes.retain(|i| !i.columns.is_empty());
        Ok(())
    }

    /// MODIFY and CHANGE: replace a column definition, renaming it in
    /// every index when the name changes.
    fn replace_column(
        &mut self,
        old: &str,
        column: ColumnDef,
        position: &Position,
    ) -> Result<(), String> {
        let at = self
            .column_position(old)
            .ok_or_else(|| format!("unknown column `{old}`"))?;
        if !column.name.eq_ignore_ascii_case(old) && self.column_position(&column.name).is_some() {
            return Err(format!("duplicate column `{}`", column.name));
        }

        self.rename_in_indexes(old, &column.name);
        let inline = inline_index(&column);
        match position {
            Position::Last => self.columns[at] = column,
            _ => {
                self.columns.remove(at);
                self.insert_column(column, position)?;
            }
        }
        if let Some(index) = inline {
            self.add_index(index)?;
        }
        Ok(())
    }

    fn rename_column(&mut self, from: &str, to: &str) -> Result<(), String> {
        let at = self
            .column_position(from)
            .ok_or_else(|| format!("unknown column `{from}`"))?;
        if self.column_position(to).is_some() {
            return Err(format!("duplicate column `{to}`"));
        }
        self.columns[at].name = to.to_owned();
        self.rename_in_indexes(from, to);
        Ok(())
    }

    fn rename_in_indexes(&mut self, from: &str, to: &str) {
        for index in &mut self.indexes {
            for column in &mut index.columns {
                if column.eq_ignore_ascii_case(from) {
                    *column = to.to_owned();
                }
            }
        }
    }

    fn add_index(&mut self, mut index: IndexDef) -> Result<(), String> {
        for column in &mut index.columns {
            let at = self
                .column_position(column)
                .ok_or_else(|| format!("key column `{column}` doesn't exist in table"))?;
            // use the declared spelling so keys match row events
            *column = self.columns[at].name.clone();
        }
        if index.columns.is_empty() {
            return Ok(());
        }

        if index.primary {
            if self.indexes.iter().any(|i| i.primary) {
                return Err("multiple primary key defined".into());
            }
            index.name = Some(PRIMARY_KEY_NAME.to_owned());
        } else {
            let name = match index.name.take() {
                Some(name) if self.index_position(&name).is_some() => {
                    return Err(format!("duplicate key name `{name}`"));
                }
                Some(name) => name,
                None => self.default_index_name(&index.columns[0]),
            };
            index.name = Some(name);
        }

        self.indexes.push(index);
        Ok(())
    }

    /// Unnamed keys take the name of their first column, suffixed on clash.
    fn default_index_name(&self, column: &str) -> String {
        if self.index_position(column).is_none() {
            return column.to_owned();
        }
        (2..)
            .map(|n| format!("{column}_{n}"))
            .find(|name| self.index_position(name).is_none())
            .unwrap_or_else(|| column.to_owned())
    }

    fn drop_index(&mut self, name: &str) -> Result<(), String> {
        let at = self
            .index_position(name)
            .ok_or_else(|| format!("can't drop index `{name}`; check that it exists"))?;
        self.indexes.remove(at);
        Ok(())
    }

    fn rename_index(&mut self, from: &str, to: &str) -> Result<(), String> {
        let at = self
            .index_position(from)
            .ok_or_else(|| format!("unknown key `{from}`"))?;
        if self.index_position(to).is_some() {
            return Err(format!("duplicate key name `{to}`"));
        }
        self.indexes[at].name = Some(to.to_owned());
        Ok(())
    }

    fn info(&self) -> TableInfo {
        let index_info = |index: &IndexDef| IndexInfo {
            name: index.name.clone().unwrap_or_default(),
            columns: index.columns.clone(),
        };
        TableInfo {
            columns: self
                .columns
                .iter()
                .filter(|c| !c.generated)
                .map(|c| c.name.clone())
                .collect(),
            primary_key: self.indexes.iter().find(|i| i.primary).map(index_info),
            unique_keys: self
                .indexes
                .iter()
                .filter(|i| i.unique && !i.primary)
                .map(index_info)
                .collect(),
        }
    }
}

fn inline_index(column: &ColumnDef) -> Option<IndexDef> {
    (column.primary || column.unique).then(|| IndexDef {
        name: None,
        primary: column.primary,
        unique: true,
        columns: vec![column.name.clone()],
    })
}

#[derive(Debug)]
struct TableEntry {
    def: TableDef,
    info: Arc<TableInfo>,
}

impl TableEntry {
    fn new(def: TableDef) -> Self {
        let info = Arc::new(def.info());
        Self { def, info }
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    databases: HashSet<String>,
    tables: HashMap<(String, String), TableEntry>,
}

/// In-process catalog driven by the DDL parser.
///
/// Replay is lenient where a real server would be strict about history it
/// never saw: `CREATE TABLE` implicitly creates its database and replaces an
/// existing definition, and dropping a database leaves its tables to their
/// own `DROP`/`CREATE` statements.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog, replaying the DDL history file (a JSON array of
    /// statements) when one is given. Reading the file is retried.
    pub fn open(history: Option<&Path>) -> Result<Self, CatalogError> {
        let catalog = Self::new();
        let Some(path) = history else {
            return Ok(catalog);
        };

        let statements = retry_with_backoff(
            SETUP_ATTEMPTS,
            SETUP_BACKOFF,
            |err: &CatalogError| matches!(err, CatalogError::Io { .. }),
            || load_history(path),
        )?;
        for statement in &statements {
            catalog.execute_ddl(statement)?;
        }
        info!(path = %path.display(), statements = statements.len(), "loaded schema history");

        Ok(catalog)
    }

    /// Names of the databases seen so far.
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().databases.iter().cloned().collect();
        names.sort();
        names
    }

    fn apply(&self, ddl: &Ddl, text: &str) -> Result<(), CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidDdl {
            statement: text.to_owned(),
            reason,
        };
        let mut state = self.state.write();

        match &ddl.statement {
            Statement::CreateDatabase {
                name,
                if_not_exists,
            } => {
                if !state.databases.insert(name.clone()) && !if_not_exists {
                    return Err(invalid(format!("database `{name}` exists")));
                }
            }
            Statement::AlterDatabase { .. } => {}
            Statement::DropDatabase { name, if_exists } => {
                if !state.databases.remove(name) && !if_exists {
                    return Err(invalid(format!("database `{name}` doesn't exist")));
                }
            }
            Statement::CreateTable {
                table,
                if_not_exists,
                columns,
                indexes,
            } => {
                let key = ddl.resolve(table)?;
                if *if_not_exists && state.tables.contains_key(&key) {
                    return Ok(());
                }
                let def = TableDef::create(columns.clone(), indexes.clone()).map_err(invalid)?;
                state.databases.insert(key.0.clone());
                state.tables.insert(key, TableEntry::new(def));
            }
            Statement::CreateTableLike {
                table,
                if_not_exists,
                source,
            } => {
                let key = ddl.resolve(table)?;
                if *if_not_exists && state.tables.contains_key(&key) {
                    return Ok(());
                }
                let source = ddl.resolve(source)?;
                let def = lookup(&state, &source)?.def.clone();
                state.databases.insert(key.0.clone());
                state.tables.insert(key, TableEntry::new(def));
            }
            Statement::DropTable { tables, if_exists } => {
                for table in tables {
                    let key = ddl.resolve(table)?;
                    if state.tables.remove(&key).is_none() && !if_exists {
                        return Err(not_found(key));
                    }
                }
            }
            Statement::TruncateTable(table) => {
                lookup(&state, &ddl.resolve(table)?)?;
            }
            Statement::RenameTable(pairs) => {
                for (from, to) in pairs {
                    let from = ddl.resolve(from)?;
                    let entry = state.tables.remove(&from).ok_or_else(|| not_found(from))?;
                    let to = ddl.resolve(to)?;
                    state.databases.insert(to.0.clone());
                    state.tables.insert(to, entry);
                }
            }
            Statement::CreateIndex { table, index } => {
                let key = ddl.resolve(table)?;
                let mut def = lookup(&state, &key)?.def.clone();
                def.add_index(index.clone()).map_err(invalid)?;
                state.tables.insert(key, TableEntry::new(def));
            }
            Statement::DropIndex { table, name } => {
                let key = ddl.resolve(table)?;
                let mut def = lookup(&state, &key)?.def.clone();
                def.drop_index(name).map_err(invalid)?;
                state.tables.insert(key, TableEntry::new(def));
            }
            Statement::AlterTable { table, specs } => {
                let from = ddl.resolve(table)?;
                let mut def = lookup(&state, &from)?.def.clone();
                let mut key = from.clone();
                for spec in specs {
                    match spec {
                        AlterSpec::RenameTable(to) => key = ddl.resolve(to)?,
                        spec => apply_alter(&mut def, spec).map_err(invalid)?,
                    }
                }
                if key != from {
                    state.tables.remove(&from);
                }
                state.databases.insert(key.0.clone());
                state.tables.insert(key, TableEntry::new(def));
            }
        }

        Ok(())
    }
}

fn apply_alter(def: &mut TableDef, spec: &AlterSpec) -> Result<(), String> {
    match spec {
        AlterSpec::AddColumns { columns, position } => {
            let mut position = position.clone();
            for column in columns {
                let name = column.name.clone();
                def.add_column(column.clone(), &position)?;
                if position != Position::Last {
                    position = Position::After(name);
                }
            }
            Ok(())
        }
        AlterSpec::DropColumn(name) => def.drop_column(name),
        AlterSpec::ModifyColumn { column, position } => {
            def.replace_column(&column.name.clone(), column.clone(), position)
        }
        AlterSpec::ChangeColumn {
            old,
            column,
            position,
        } => def.replace_column(old, column.clone(), position),
        AlterSpec::RenameColumn { from, to } => def.rename_column(from, to),
        AlterSpec::AddIndex(index) => def.add_index(index.clone()),
        AlterSpec::DropPrimaryKey => def.drop_index(PRIMARY_KEY_NAME),
        AlterSpec::DropIndex(name) => def.drop_index(name),
        AlterSpec::RenameIndex { from, to } => def.rename_index(from, to),
        AlterSpec::RenameTable(_) | AlterSpec::Other => Ok(()),
    }
}

fn lookup<'a>(state: &'a CatalogState, key: &(String, String)) -> Result<&'a TableEntry, CatalogError> {
    state
        .tables
        .get(key)
        .ok_or_else(|| not_found(key.clone()))
}

fn not_found((schema, table): (String, String)) -> CatalogError {
    CatalogError::TableNotFound { schema, table }
}

fn load_history(path: &Path) -> Result<Vec<String>, CatalogError> {
    let data = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| CatalogError::History {
        path: path.to_path_buf(),
        source,
    })
}

impl SchemaCatalog for MemoryCatalog {
    fn execute_ddl(&self, statement: &str) -> Result<(), CatalogError> {
        info!(ddl = statement, "execute ddl");
        let ddl = Ddl::parse(statement)?;
        self.apply(&ddl, statement)
    }

    fn table_info(&self, schema: &str, table: &str) -> Result<Arc<TableInfo>, CatalogError> {
        let state = self.state.read();
        state
            .tables
            .get(&(schema.to_owned(), table.to_owned()))
            .map(|entry| Arc::clone(&entry.info))
            .filter(|info| !info.columns.is_empty())
            .ok_or_else(|| CatalogError::TableNotExist {
                schema: schema.to_owned(),
                table: table.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn names(list: &[String]) -> Vec<&str> {
        list.iter().map(String::as_str).collect()
    }

    #[test]
    fn create_table_reports_columns_and_keys() {
        let catalog = MemoryCatalog::new();
        catalog
            .execute_ddl(
                "use test; create table t (a int, b int, c int as (a + b), d varchar(8), \
                 primary key (a), unique key (d), unique (b, d))",
            )
            .unwrap();

        let info = catalog.table_info("test", "t").unwrap();
        assert_eq!(names(&info.columns), vec!["a", "b", "d"]);
        assert_eq!(info.primary_key.as_ref().unwrap().name, PRIMARY_KEY_NAME);
        assert_eq!(names(info.key_columns()), vec!["a"]);
        let unique: Vec<_> = info.unique_keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(unique, vec!["d", "b"]);
        assert_eq!(catalog.databases(), vec!["test".to_string()]);
    }

    #[test]
    fn alter_table_refreshes_table_info() {
        let catalog = MemoryCatalog::new();
        catalog
            .execute_ddl("create table s.t (a int primary key, b int)")
            .unwrap();
        let before = catalog.table_info("s", "t").unwrap();

        catalog
            .execute_ddl("alter table s.t drop primary key, add column c int first, add unique key uk (b)")
            .unwrap();
        let after = catalog.table_info("s", "t").unwrap();

        assert_eq!(names(before.key_columns()), vec!["a"]);
        assert_eq!(names(&after.columns), vec!["c", "a", "b"]);
        assert!(after.primary_key.is_none());
        assert_eq!(names(after.key_columns()), vec!["b"]);
    }

    #[test]
    fn dropping_a_key_column_shrinks_the_key() {
        let catalog = MemoryCatalog::new();
        catalog
            .execute_ddl("create table s.t (a int, b int, c int, primary key (a, b))")
            .unwrap();
        catalog.execute_ddl("alter table s.t drop column b").unwrap();
        assert_eq!(names(catalog.table_info("s", "t").unwrap().key_columns()), vec!["a"]);

        catalog.execute_ddl("alter table s.t change a z bigint").unwrap();
        assert_eq!(names(catalog.table_info("s", "t").unwrap().key_columns()), vec!["z"]);
    }

    #[test]
    fn keyless_table_uses_all_columns() {
        let catalog = MemoryCatalog::new();
        catalog.execute_ddl("create table s.t (a int, b int)").unwrap();
        let info = catalog.table_info("s", "t").unwrap();
        assert_eq!(names(info.key_columns()), vec!["a", "b"]);

        catalog.execute_ddl("create unique index ub on s.t (b)").unwrap();
        assert_eq!(names(catalog.table_info("s", "t").unwrap().key_columns()), vec!["b"]);

        catalog.execute_ddl("drop index ub on s.t").unwrap();
        assert_eq!(names(catalog.table_info("s", "t").unwrap().key_columns()), vec!["a", "b"]);
    }

    #[test]
    fn missing_tables() {
        let catalog = MemoryCatalog::new();
        assert!(matches!(
            catalog.table_info("s", "nope"),
            Err(CatalogError::TableNotExist { .. })
        ));
        assert!(matches!(
            catalog.execute_ddl("alter table s.nope add column x int"),
            Err(CatalogError::TableNotFound { .. })
        ));
        assert!(matches!(
            catalog.execute_ddl("drop table s.nope"),
            Err(CatalogError::TableNotFound { .. })
        ));
        catalog.execute_ddl("drop table if exists s.nope").unwrap();
    }

    #[test]
    fn drop_and_rename() {
        let catalog = MemoryCatalog::new();
        catalog.execute_ddl("create table s.a (x int primary key)").unwrap();
        catalog.execute_ddl("rename table s.a to s.b").unwrap();
        assert_eq!(names(&catalog.table_info("s", "b").unwrap().columns), vec!["x"]);
        assert!(catalog.table_info("s", "a").is_err());

        catalog.execute_ddl("alter table s.b add column y int, rename to s.c").unwrap();
        assert!(catalog.table_info("s", "b").is_err());
        assert_eq!(names(&catalog.table_info("s", "c").unwrap().columns), vec!["x", "y"]);
        catalog.execute_ddl("rename table s.c to s.b").unwrap();

        catalog.execute_ddl("drop table s.b").unwrap();
        assert!(catalog.table_info("s", "b").is_err());
    }

    #[test]
    fn database_statements() {
        let catalog = MemoryCatalog::new();
        catalog.execute_ddl("create database test1").unwrap();
        assert!(catalog.execute_ddl("create database test1").is_err());
        catalog.execute_ddl("create database if not exists test1").unwrap();
        catalog.execute_ddl("drop database test1").unwrap();
        assert!(catalog.databases().is_empty());
    }

    #[test]
    fn invalid_key_definition_is_rejected() {
        let catalog = MemoryCatalog::new();
        assert!(matches!(
            catalog.execute_ddl("create table s.t (a int, primary key (zz))"),
            Err(CatalogError::InvalidDdl { .. })
        ));
    }

    #[test]
    fn history_file_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        fs::write(
            &path,
            r#"["create database d", "use d; create table t (id int primary key)"]"#,
        )
        .unwrap();

        let catalog = MemoryCatalog::open(Some(&path)).unwrap();
        assert_eq!(names(catalog.table_info("d", "t").unwrap().key_columns()), vec!["id"]);
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_with_backoff(
            3,
            Duration::from_millis(1),
            |_| true,
            || {
                calls.set(calls.get() + 1);
                Err("transient".to_string())
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);

        let calls = Cell::new(0);
        let result: Result<(), String> = retry_with_backoff(
            3,
            Duration::from_millis(1),
            |_| false,
            || {
                calls.set(calls.get() + 1);
                Err("fatal".to_string())
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
