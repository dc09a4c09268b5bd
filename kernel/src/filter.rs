// Schema / Table Filter
//
// Decides which schemas and tables take part in a run. Names starting
// with `~` are regular expressions; everything else matches exactly,
// ignoring ASCII case.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Schemas that never take part in a run.
pub const SYSTEM_SCHEMAS: [&str; 4] = ["mysql", "information_schema", "performance_schema", "sys"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRule {
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub do_dbs: Vec<String>,
    pub do_tables: Vec<TableRule>,
    pub ignore_dbs: Vec<String>,
    pub ignore_tables: Vec<TableRule>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid filter pattern `{pattern}`: {source}")]
pub struct FilterError {
    pattern: String,
    #[source]
    source: regex::Error,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn new(rule: &str) -> Result<Self, FilterError> {
        match rule.strip_prefix('~') {
            Some(pattern) => Regex::new(&format!("(?i){pattern}"))
                .map(Matcher::Pattern)
                .map_err(|source| FilterError {
                    pattern: pattern.to_owned(),
                    source,
                }),
            None => Ok(Matcher::Exact(rule.to_owned())),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Exact(exact) => exact.eq_ignore_ascii_case(name),
            Matcher::Pattern(regex) => regex.is_match(name),
        }
    }
}

#[derive(Debug, Clone)]
struct TableMatcher {
    schema: Matcher,
    table: Matcher,
}

impl TableMatcher {
    fn new(rule: &TableRule) -> Result<Self, FilterError> {
        Ok(Self {
            schema: Matcher::new(&rule.schema)?,
            table: Matcher::new(&rule.table)?,
        })
    }
}

/// Compiled [`FilterConfig`].
///
/// Ignore rules win over do rules. Without any do rule every
/// non-ignored table passes; otherwise a table must match `do_dbs` or
/// `do_tables`.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    do_dbs: Vec<Matcher>,
    do_tables: Vec<TableMatcher>,
    ignore_dbs: Vec<Matcher>,
    ignore_tables: Vec<TableMatcher>,
}

impl TableFilter {
    pub fn new(config: &FilterConfig) -> Result<Self, FilterError> {
        let dbs = |rules: &[String]| rules.iter().map(|r| Matcher::new(r)).collect::<Result<Vec<_>, _>>();
        let tables =
            |rules: &[TableRule]| rules.iter().map(TableMatcher::new).collect::<Result<Vec<_>, _>>();

        Ok(Self {
            do_dbs: dbs(&config.do_dbs)?,
            do_tables: tables(&config.do_tables)?,
            ignore_dbs: dbs(&config.ignore_dbs)?,
            ignore_tables: tables(&config.ignore_tables)?,
        })
    }

    /// Whether records of `schema`.`table` are compacted. A `None` table
    /// asks about schema level statements.
    pub fn allows(&self, schema: &str, table: Option<&str>) -> bool {
        if SYSTEM_SCHEMAS.iter().any(|s| s.eq_ignore_ascii_case(schema)) {
            return false;
        }
        if self.ignore_dbs.iter().any(|m| m.matches(schema)) {
            return false;
        }
        if let Some(table) = table {
            if self
                .ignore_tables
                .iter()
                .any(|m| m.schema.matches(schema) && m.table.matches(table))
            {
                return false;
            }
        }

        if self.do_dbs.is_empty() && self.do_tables.is_empty() {
            return true;
        }
        if self.do_dbs.iter().any(|m| m.matches(schema)) {
            return true;
        }
        self.do_tables.iter().any(|m| {
            m.schema.matches(schema) && table.map_or(true, |table| m.table.matches(table))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(schema: &str, table: &str) -> TableRule {
        TableRule {
            schema: schema.into(),
            table: table.into(),
        }
    }

    #[test]
    fn empty_filter_passes_user_tables_only() {
        let filter = TableFilter::default();
        assert!(filter.allows("shop", Some("orders")));
        assert!(filter.allows("shop", None));
        assert!(!filter.allows("mysql", Some("user")));
        assert!(!filter.allows("INFORMATION_SCHEMA", None));
    }

    #[test]
    fn ignore_rules_win() {
        let filter = TableFilter::new(&FilterConfig {
            do_dbs: vec!["shop".into()],
            ignore_tables: vec![rule("shop", "~^tmp_")],
            ..FilterConfig::default()
        })
        .unwrap();

        assert!(filter.allows("shop", Some("orders")));
        assert!(!filter.allows("shop", Some("tmp_orders")));
        assert!(!filter.allows("other", Some("orders")));
    }

    #[test]
    fn do_tables_select_single_tables() {
        let filter = TableFilter::new(&FilterConfig {
            do_tables: vec![rule("shop", "Orders"), rule("~^log_\\d+$", "events")],
            ignore_dbs: vec!["log_0".into()],
            ..FilterConfig::default()
        })
        .unwrap();

        assert!(filter.allows("shop", Some("orders")));
        assert!(!filter.allows("shop", Some("users")));
        assert!(filter.allows("log_7", Some("events")));
        assert!(!filter.allows("log_0", Some("events")));
        // schema level statements follow any table rule of the schema
        assert!(filter.allows("shop", None));
        assert!(!filter.allows("misc", None));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let err = TableFilter::new(&FilterConfig {
            do_dbs: vec!["~(".into()],
            ..FilterConfig::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("invalid filter pattern"));
    }
}
