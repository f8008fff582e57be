//! MySQL -> ClickHouse translation: column types, row values and in-flight
//! DDL rewriting. Everything here is driven by explicit context (config and
//! the per-table structures); there is no hidden shared state.

mod charset;
mod ddl;
mod enums;
mod spatial;
mod types;
mod values;

pub use enums::parse_mysql_enum;
pub use values::{compare_values, record_id};

use std::collections::HashMap;

use common::config::Settings;
use common::err::{CResult, ReplError};
use common::schema::TableStructure;

/// (mysql structure, clickhouse structure) per replicated table.
pub type TablesStructure = HashMap<String, (TableStructure, TableStructure)>;

/// Translator between the MySQL and ClickHouse type systems.
///
/// `database`/`target_database` name the replicated pair; DDL statements
/// naming other databases are reported as non-matching and dropped by the
/// caller.
pub struct MysqlToClickhouseConverter {
    pub settings: Settings,
    pub database: String,
    pub target_database: String,
}

impl MysqlToClickhouseConverter {
    pub fn new(settings: Settings, database: &str, target_database: &str) -> Self {
        MysqlToClickhouseConverter {
            settings,
            database: database.to_string(),
            target_database: target_database.to_string(),
        }
    }

    /// Split a `[db.]table` token, check it against the filters and map the
    /// source database name to the target one.
    pub fn get_db_and_table_name(&self, token: &str, db_name: &str) -> (String, String, bool) {
        let (mut db_name, table_name) = match token.split_once('.') {
            Some((db, table)) => (strip_sql_name(db), strip_sql_name(table)),
            None => (db_name.to_string(), strip_sql_name(token)),
        };

        // A relative table name may arrive with the event already attributed
        // to the target database; filter checks then use the source name.
        let matches = if !token.contains('.') && self.target_database == db_name {
            self.settings.is_database_matches(&self.database)
                && self.settings.is_table_matches(&table_name)
        } else {
            self.settings.is_database_matches(&db_name)
                && self.settings.is_table_matches(&table_name)
        };

        if db_name == self.database {
            db_name = self.target_database.clone();
        }

        (db_name, table_name, matches)
    }
}

/// Strip surrounding backticks and whitespace from an identifier.
pub fn strip_sql_name(name: &str) -> String {
    let name = name.trim();
    let name = name.strip_prefix('`').unwrap_or(name);
    let name = name.strip_suffix('`').unwrap_or(name);
    name.to_string()
}

/// Split `data` at top-level occurrences of `token`: separators inside
/// parentheses or quoted literals do not count.
pub fn split_high_level(data: &str, token: char) -> Vec<String> {
    let mut results = Vec::new();
    let mut level: i32 = 0;
    let mut in_quote: Option<char> = None;
    let mut prev_escape = false;
    let mut curr = String::new();

    for c in data.chars() {
        if let Some(quote) = in_quote {
            curr.push(c);
            if prev_escape {
                prev_escape = false;
            } else if c == '\\' && quote != '`' {
                prev_escape = true;
            } else if c == quote {
                in_quote = None;
            }
            continue;
        }
        match c {
            c if c == token && level == 0 => {
                results.push(curr.trim().to_string());
                curr.clear();
            }
            '\'' | '"' | '`' => {
                in_quote = Some(c);
                curr.push(c);
            }
            '(' => {
                level += 1;
                curr.push(c);
            }
            ')' => {
                level -= 1;
                curr.push(c);
            }
            c => curr.push(c),
        }
    }
    if !curr.trim().is_empty() {
        results.push(curr.trim().to_string());
    }
    results
}

/// Remove SQL comments (`-- ...`, `# ...`, `/* ... */`) outside string
/// literals.
pub fn strip_sql_comments(statement: &str) -> String {
    let chars: Vec<char> = statement.chars().collect();
    let mut result = String::with_capacity(statement.len());
    let mut idx = 0;
    let mut in_quote: Option<char> = None;

    while idx < chars.len() {
        let c = chars[idx];
        if let Some(quote) = in_quote {
            result.push(c);
            if c == '\\' && quote != '`' && idx + 1 < chars.len() {
                result.push(chars[idx + 1]);
                idx += 2;
                continue;
            }
            if c == quote {
                in_quote = None;
            }
            idx += 1;
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                in_quote = Some(c);
                result.push(c);
                idx += 1;
            }
            '-' if chars.get(idx + 1) == Some(&'-')
                && matches!(chars.get(idx + 2), None | Some(' ') | Some('\t') | Some('\n')) =>
            {
                while idx < chars.len() && chars[idx] != '\n' {
                    idx += 1;
                }
            }
            '#' => {
                while idx < chars.len() && chars[idx] != '\n' {
                    idx += 1;
                }
            }
            '/' if chars.get(idx + 1) == Some(&'*') => {
                idx += 2;
                while idx + 1 < chars.len() && !(chars[idx] == '*' && chars[idx + 1] == '/') {
                    idx += 1;
                }
                idx = (idx + 2).min(chars.len());
            }
            c => {
                result.push(c);
                idx += 1;
            }
        }
    }
    result.trim().to_string()
}

/// Reject multi-statement input, drop a single trailing semicolon.
pub(crate) fn basic_validate_query(query: &str) -> CResult<String> {
    let mut query = query.trim().to_string();
    if query.ends_with(';') {
        query.pop();
    }
    if query.contains(';') {
        return Err(ReplError::ParseError(
            "multi-query statement not supported".to_string(),
        ));
    }
    Ok(query)
}
