//! In-flight DDL rewriting: ALTER TABLE translation with live structure
//! updates, and CREATE TABLE parsing into a [`TableStructure`].

use lazy_static::lazy_static;
use regex::Regex;

use common::err::{CResult, ReplError};
use common::schema::{TableField, TableStructure};

use super::enums::{
    extract_enum_or_set_values, extract_parenthesized_content, split_enum_or_set_definition,
};
use super::{
    basic_validate_query, split_high_level, strip_sql_name, MysqlToClickhouseConverter,
    TablesStructure,
};

lazy_static! {
    // COMMENT 'text' / COMMENT = "text" clauses poison the tokenizer and are
    // stripped up front; escaped quotes inside the text are honored.
    static ref COMMENT_CLAUSE_RE: Regex = Regex::new(
        r#"(?i)\bCOMMENT(?:\s*=\s*|\s+)(?:'(?:\\.|[^'\\])*'|"(?:\\.|[^"\\])*")"#
    )
    .expect("valid pattern");

    // One token of an ALTER column definition: a backquoted identifier or a
    // word, either optionally followed by a parenthesized argument list, a
    // quoted string, or any other non-whitespace run.
    static ref ALTER_TOKEN_RE: Regex = Regex::new(
        r#"(?x)
        (
            `[^`]+`(?:\([^)]*\))?    |
            \w+(?:\([^)]*\))?        |
            '(?:\\'|[^'])*'          |
            "(?:\\"|[^"])*"          |
            [^\s]+
        )
        "#
    )
    .expect("valid pattern");

    static ref CREATE_TABLE_HEADER_RE: Regex = Regex::new(
        r#"(?is)^\s*create\s+table\s+(?P<if_not_exists>if\s+not\s+exists\s+)?"#
    )
    .expect("valid pattern");

    static ref CREATE_LIKE_RE: Regex = Regex::new(
        r#"(?is)create\s+table\s+(?:if\s+not\s+exists\s+)?[`"]?(?P<target>[^`"\s(]+)[`"]?\s+like\s+[`"]?(?P<source>[^`"\s;]+)[`"]?"#
    )
    .expect("valid pattern");

    static ref TABLE_CHARSET_RE: Regex =
        Regex::new(r"(?i)charset\s*=\s*([A-Za-z0-9_]+)").expect("valid pattern");

    static ref PRIMARY_KEY_LINE_RE: Regex =
        Regex::new(r"(?is)^primary\s+key\s*\(").expect("valid pattern");
}

/// Column options that terminate the type part of a column definition.
const CONSTRAINT_KEYWORDS: &[&str] = &[
    "DEFAULT",
    "NOT",
    "NULL",
    "AUTO_INCREMENT",
    "PRIMARY",
    "UNIQUE",
    "COMMENT",
    "COLLATE",
    "REFERENCES",
    "ON",
    "CHECK",
    "CONSTRAINT",
    "AFTER",
    "BEFORE",
    "GENERATED",
    "VIRTUAL",
    "STORED",
    "FIRST",
    "ALWAYS",
    "AS",
    "IDENTITY",
    "INVISIBLE",
    "PERSISTED",
];

/// Sub-operations of ADD/DROP that have no column effect on the target.
const INDEX_LIKE_KEYWORDS: &[&str] = &[
    "constraint", "index", "foreign", "unique", "key", "fulltext", "spatial",
];

pub(crate) fn strip_comment_clauses(statement: &str) -> String {
    COMMENT_CLAUSE_RE.replace_all(statement, "").to_string()
}

/// Tokenize an ALTER column definition, keeping quoted identifiers and
/// parenthesized argument lists (`NUMERIC(5, 2)`) as single tokens.
pub(crate) fn tokenize_raw(sql_line: &str) -> Vec<String> {
    ALTER_TOKEN_RE
        .find_iter(sql_line)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Merge the leading tokens of a definition tail into the column type, up to
/// the first constraint keyword. Multi-word types (`DOUBLE PRECISION`,
/// `INT UNSIGNED`) come out as one string; the rest are the parameters.
pub(crate) fn merge_type_tokens(tokens: &[String]) -> (String, Vec<String>) {
    let mut i = 0;
    let mut type_tokens = Vec::new();
    while i < tokens.len() && !CONSTRAINT_KEYWORDS.contains(&tokens[i].to_uppercase().as_str()) {
        type_tokens.push(tokens[i].clone());
        i += 1;
    }
    (type_tokens.join(" "), tokens[i..].to_vec())
}

/// Tokenize one ALTER column definition into
/// `[column name, merged type, params...]`.
pub(crate) fn tokenize_alter_query(sql_line: &str) -> Vec<String> {
    let tokens = tokenize_raw(sql_line);
    if tokens.is_empty() {
        return tokens;
    }
    let column_name = tokens[0].clone();
    let (merged_type, params) = merge_type_tokens(&tokens[1..]);
    let mut result = vec![column_name];
    if !merged_type.is_empty() {
        result.push(merged_type);
    }
    result.extend(params);
    result
}

impl MysqlToClickhouseConverter {
    /// Translate an `ALTER TABLE` statement. Structures in `tables` are
    /// updated in place; the returned statements are the target-side
    /// equivalents to execute, in order. A statement for a filtered-out
    /// table yields no statements and no changes.
    pub fn convert_alter_query(
        &self,
        mysql_query: &str,
        db_name: &str,
        tables: &mut TablesStructure,
    ) -> CResult<Vec<String>> {
        let query = basic_validate_query(mysql_query)?;
        let tokens: Vec<&str> = query.split_whitespace().collect();
        if tokens.len() < 4
            || !tokens[0].eq_ignore_ascii_case("alter")
            || !tokens[1].eq_ignore_ascii_case("table")
        {
            return Err(ReplError::ParseError(format!("wrong query: {}", query)));
        }

        let (db_name, table_name, matches) = self.get_db_and_table_name(tokens[2], db_name);
        if !matches {
            return Ok(Vec::new());
        }

        let mut statements = Vec::new();
        let subqueries = tokens[3..].join(" ");
        for subquery in split_high_level(&subqueries, ',') {
            let sub_tokens: Vec<&str> = subquery.split_whitespace().collect();
            if sub_tokens.is_empty() {
                continue;
            }
            let op_name = sub_tokens[0].to_lowercase();
            let mut rest: &[&str] = &sub_tokens[1..];
            if rest
                .first()
                .map(|t| t.eq_ignore_ascii_case("column"))
                .unwrap_or(false)
            {
                rest = &rest[1..];
            }

            match op_name.as_str() {
                "add" => {
                    if first_is_index_like(rest) {
                        continue;
                    }
                    statements.extend(self.alter_add_column(
                        &db_name,
                        &table_name,
                        rest,
                        tables,
                    )?);
                }
                "drop" => {
                    if first_is_index_like(rest) {
                        continue;
                    }
                    statements.extend(self.alter_drop_column(
                        &db_name,
                        &table_name,
                        rest,
                        tables,
                    )?);
                }
                "modify" => {
                    statements.extend(self.alter_modify_column(
                        &db_name,
                        &table_name,
                        rest,
                        tables,
                    )?);
                }
                "change" => {
                    statements.extend(self.alter_change_column(
                        &db_name,
                        &table_name,
                        rest,
                        tables,
                    )?);
                }
                "rename" => {
                    // only RENAME COLUMN a TO b arrives here; RENAME TO is a
                    // table rename and travels as a separate statement kind
                    statements.extend(self.alter_rename_column(
                        &db_name,
                        &table_name,
                        rest,
                        tables,
                    )?);
                }
                "alter" | "auto_increment" => continue,
                other => {
                    return Err(ReplError::ParseError(format!(
                        "operation {} not implemented, query: {}, full query: {}",
                        other, subquery, mysql_query
                    )))
                }
            }
        }
        Ok(statements)
    }

    fn structures_mut<'a>(
        tables: &'a mut TablesStructure,
        table_name: &str,
    ) -> CResult<&'a mut (TableStructure, TableStructure)> {
        tables.get_mut(table_name).ok_or_else(|| {
            ReplError::Fatal(format!("table {} is not tracked", table_name))
        })
    }

    fn alter_add_column(
        &self,
        db_name: &str,
        table_name: &str,
        tokens: &[&str],
        tables: &mut TablesStructure,
    ) -> CResult<Vec<String>> {
        let mut tokens = tokenize_alter_query(&tokens.join(" "));
        if tokens.len() < 2 {
            return Err(ReplError::ParseError(format!(
                "wrong tokens count: {:?}",
                tokens
            )));
        }

        let mut column_after = None;
        let mut column_first = false;
        if tokens[tokens.len() - 2].eq_ignore_ascii_case("after") {
            column_after = Some(strip_sql_name(&tokens[tokens.len() - 1]));
            tokens.truncate(tokens.len() - 2);
            if tokens.len() < 2 {
                return Err(ReplError::ParseError(format!(
                    "wrong tokens count: {:?}",
                    tokens
                )));
            }
        } else if tokens[tokens.len() - 1].eq_ignore_ascii_case("first") {
            column_first = true;
            tokens.truncate(tokens.len() - 1);
        }

        let column_name = strip_sql_name(&tokens[0]);
        let column_type_mysql = tokens[1].clone();
        let column_parameters = tokens[2..].join(" ");
        let column_type_ch = self.convert_field_type(&column_type_mysql, &column_parameters)?;

        let (mysql_structure, ch_structure) = Self::structures_mut(tables, table_name)?;

        let mysql_field = TableField {
            name: column_name.clone(),
            field_type: column_type_mysql.clone(),
            parameters: column_parameters,
            additional_data: extract_enum_or_set_values(&column_type_mysql)?,
        };
        let ch_field = TableField::new(&column_name, &column_type_ch);

        let query;
        if column_first {
            mysql_structure.add_field_first(mysql_field)?;
            ch_structure.add_field_first(ch_field)?;
            query = format!(
                "ALTER TABLE `{}`.`{}` ADD COLUMN `{}` {} FIRST",
                db_name, table_name, column_name, column_type_ch
            );
        } else {
            let column_after = match column_after {
                Some(column_after) => column_after,
                None => mysql_structure
                    .fields
                    .last()
                    .map(|f| f.name.clone())
                    .ok_or_else(|| {
                        ReplError::Fatal(format!("table {} has no columns", table_name))
                    })?,
            };
            mysql_structure.add_field_after(mysql_field, &column_after)?;
            ch_structure.add_field_after(ch_field, &column_after)?;
            query = format!(
                "ALTER TABLE `{}`.`{}` ADD COLUMN `{}` {} AFTER {}",
                db_name, table_name, column_name, column_type_ch, column_after
            );
        }
        Ok(vec![query])
    }

    fn alter_drop_column(
        &self,
        db_name: &str,
        table_name: &str,
        tokens: &[&str],
        tables: &mut TablesStructure,
    ) -> CResult<Vec<String>> {
        if tokens.len() != 1 {
            return Err(ReplError::ParseError(format!(
                "wrong tokens count: {:?}",
                tokens
            )));
        }
        let column_name = strip_sql_name(tokens[0]);

        let (mysql_structure, ch_structure) = Self::structures_mut(tables, table_name)?;
        mysql_structure.remove_field(&column_name)?;
        ch_structure.remove_field(&column_name)?;

        Ok(vec![format!(
            "ALTER TABLE `{}`.`{}` DROP COLUMN {}",
            db_name, table_name, column_name
        )])
    }

    fn alter_modify_column(
        &self,
        db_name: &str,
        table_name: &str,
        tokens: &[&str],
        tables: &mut TablesStructure,
    ) -> CResult<Vec<String>> {
        let tokens = tokenize_alter_query(&tokens.join(" "));
        if tokens.len() < 2 {
            return Err(ReplError::ParseError(format!(
                "wrong tokens count: {:?}",
                tokens
            )));
        }
        let column_name = strip_sql_name(&tokens[0]);
        let column_type_mysql = tokens[1].clone();
        let column_parameters = tokens[2..].join(" ");
        let column_type_ch = self.convert_field_type(&column_type_mysql, &column_parameters)?;

        let (mysql_structure, ch_structure) = Self::structures_mut(tables, table_name)?;
        mysql_structure.update_field(TableField {
            name: column_name.clone(),
            field_type: column_type_mysql.clone(),
            parameters: column_parameters,
            additional_data: extract_enum_or_set_values(&column_type_mysql)?,
        })?;
        ch_structure.update_field(TableField::new(&column_name, &column_type_ch))?;

        Ok(vec![format!(
            "ALTER TABLE `{}`.`{}` MODIFY COLUMN `{}` {}",
            db_name, table_name, column_name, column_type_ch
        )])
    }

    fn alter_change_column(
        &self,
        db_name: &str,
        table_name: &str,
        tokens: &[&str],
        tables: &mut TablesStructure,
    ) -> CResult<Vec<String>> {
        let tokens = tokenize_raw(&tokens.join(" "));
        if tokens.len() < 3 {
            return Err(ReplError::ParseError(format!(
                "wrong tokens count: {:?}",
                tokens
            )));
        }
        let column_name = strip_sql_name(&tokens[0]);
        let new_column_name = strip_sql_name(&tokens[1]);
        let (column_type_mysql, params) = merge_type_tokens(&tokens[2..]);
        let column_parameters = params.join(" ");
        let column_type_ch = self.convert_field_type(&column_type_mysql, &column_parameters)?;

        let (mysql_structure, ch_structure) = Self::structures_mut(tables, table_name)?;
        let mut statements = Vec::new();

        let current_type_ch = ch_structure
            .get_field(&column_name)
            .map(|f| f.field_type.clone())
            .ok_or_else(|| {
                ReplError::ParseError(format!("column {} not found", column_name))
            })?;

        if current_type_ch != column_type_ch {
            mysql_structure.update_field(TableField {
                name: column_name.clone(),
                field_type: column_type_mysql.clone(),
                parameters: column_parameters,
                additional_data: extract_enum_or_set_values(&column_type_mysql)?,
            })?;
            ch_structure.update_field(TableField::new(&column_name, &column_type_ch))?;
            statements.push(format!(
                "ALTER TABLE `{}`.`{}` MODIFY COLUMN {} {}",
                db_name, table_name, column_name, column_type_ch
            ));
        }

        if column_name != new_column_name {
            rename_structure_field(mysql_structure, &column_name, &new_column_name)?;
            rename_structure_field(ch_structure, &column_name, &new_column_name)?;
            statements.push(format!(
                "ALTER TABLE `{}`.`{}` RENAME COLUMN {} TO {}",
                db_name, table_name, column_name, new_column_name
            ));
        }
        Ok(statements)
    }

    fn alter_rename_column(
        &self,
        db_name: &str,
        table_name: &str,
        tokens: &[&str],
        tables: &mut TablesStructure,
    ) -> CResult<Vec<String>> {
        if tokens.len() < 3 {
            return Err(ReplError::ParseError(format!(
                "wrong tokens count for RENAME COLUMN: {:?}",
                tokens
            )));
        }
        let old_column_name = strip_sql_name(tokens[0]);
        if !tokens[1].eq_ignore_ascii_case("to") {
            return Err(ReplError::ParseError(format!(
                "expected TO keyword in RENAME COLUMN syntax: {:?}",
                tokens
            )));
        }
        let new_column_name = strip_sql_name(tokens[2]);

        let (mysql_structure, ch_structure) = Self::structures_mut(tables, table_name)?;
        rename_structure_field(mysql_structure, &old_column_name, &new_column_name)?;
        rename_structure_field(ch_structure, &old_column_name, &new_column_name)?;

        Ok(vec![format!(
            "ALTER TABLE `{}`.`{}` RENAME COLUMN `{}` TO `{}`",
            db_name, table_name, old_column_name, new_column_name
        )])
    }

    /// Parse a CREATE TABLE statement into aligned source and target
    /// structures. `CREATE TABLE t LIKE t2` copies the already-known
    /// structure of `t2` under the new name.
    pub fn parse_create_table_query(
        &self,
        mysql_query: &str,
        tables: &TablesStructure,
    ) -> CResult<(TableStructure, TableStructure)> {
        if mysql_query.to_uppercase().contains("LIKE") {
            if let Some(captures) = CREATE_LIKE_RE.captures(mysql_query) {
                let target_table_name = strip_sql_name(&captures["target"]);
                let source_table_name = strip_sql_name(&captures["source"]);
                let (source_mysql, source_ch) =
                    tables.get(&source_table_name).ok_or_else(|| {
                        ReplError::ParseError(format!(
                            "source table '{}' of LIKE statement is unknown",
                            source_table_name
                        ))
                    })?;
                let mut mysql_structure = source_mysql.clone();
                mysql_structure.table_name = target_table_name.clone();
                let mut ch_structure = source_ch.clone();
                ch_structure.table_name = target_table_name;
                return Ok((mysql_structure, ch_structure));
            }
        }

        let mysql_structure = self.parse_mysql_table_structure(mysql_query)?;
        let ch_structure = self.convert_table_structure(&mysql_structure)?;
        Ok((mysql_structure, ch_structure))
    }

    /// Parse the column list of a CREATE TABLE statement.
    pub fn parse_mysql_table_structure(&self, create_statement: &str) -> CResult<TableStructure> {
        let create_statement = strip_comment_clauses(create_statement);

        let header = CREATE_TABLE_HEADER_RE
            .captures(&create_statement)
            .ok_or_else(|| {
                ReplError::ParseError(format!("wrong create statement: {}", create_statement))
            })?;

        let mut structure = TableStructure {
            if_not_exists: header.name("if_not_exists").is_some(),
            ..Default::default()
        };

        let rest = &create_statement[header.get(0).map(|m| m.end()).unwrap_or(0)..];
        let (table_token, rest) = take_identifier(rest)?;
        structure.table_name = table_name_of(&table_token);

        let rest = rest.trim_start();
        let paren_pos = rest.find('(').ok_or_else(|| {
            ReplError::ParseError(format!("wrong create statement: {}", create_statement))
        })?;
        if !rest[..paren_pos].trim().is_empty() {
            // anything between the name and the column list (e.g. LIKE)
            return Err(ReplError::ParseError(format!(
                "wrong create statement: {}",
                create_statement
            )));
        }
        let inner = extract_parenthesized_content(rest, paren_pos)?;

        if let Some(captures) = TABLE_CHARSET_RE.captures(&create_statement) {
            structure.charset = captures[1].to_string();
        }

        for line in split_high_level(&inner, ',') {
            let lower = line.to_lowercase();
            if lower.starts_with("unique key")
                || lower.starts_with("key")
                || lower.starts_with("constraint")
                || lower.starts_with("fulltext")
                || lower.starts_with("spatial")
            {
                continue;
            }
            if PRIMARY_KEY_LINE_RE.is_match(&line) {
                let open = line.find('(').ok_or_else(|| {
                    ReplError::ParseError(format!("wrong primary key line: {}", line))
                })?;
                let keys = extract_parenthesized_content(&line, open)?;
                structure.primary_keys = keys
                    .split(',')
                    .map(strip_sql_name)
                    .filter(|k| !k.is_empty())
                    .collect();
                continue;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (field_name, definition) = if let Some(stripped) = line.strip_prefix('`') {
                let end = stripped.find('`').ok_or_else(|| {
                    ReplError::ParseError(format!("unterminated identifier: {}", line))
                })?;
                (
                    stripped[..end].to_string(),
                    stripped[end + 1..].trim().to_string(),
                )
            } else {
                let mut parts = line.splitn(2, char::is_whitespace);
                let name = strip_sql_name(parts.next().unwrap_or_default());
                (name, parts.next().unwrap_or_default().trim().to_string())
            };

            let (field_type, field_parameters) = split_enum_or_set_definition(&definition);
            let additional_data = extract_enum_or_set_values(&field_type)?;

            structure.fields.push(TableField {
                name: field_name,
                field_type,
                parameters: field_parameters,
                additional_data,
            });
        }

        if structure.primary_keys.is_empty() {
            structure.primary_keys = structure
                .fields
                .iter()
                .filter(|f| f.parameters.to_lowercase().contains("primary key"))
                .map(|f| f.name.clone())
                .collect();
        }
        if structure.primary_keys.is_empty() && structure.has_field("id") {
            structure.primary_keys = vec!["id".to_string()];
        }
        if structure.primary_keys.is_empty() {
            return Err(ReplError::ParseError(format!(
                "no primary key for table {}, {}",
                structure.table_name, create_statement
            )));
        }

        structure.preprocess()?;
        Ok(structure)
    }
}

fn first_is_index_like(tokens: &[&str]) -> bool {
    tokens
        .first()
        .map(|t| INDEX_LIKE_KEYWORDS.contains(&t.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn rename_structure_field(
    structure: &mut TableStructure,
    old_name: &str,
    new_name: &str,
) -> CResult<()> {
    let field = structure.get_field_mut(old_name).ok_or_else(|| {
        ReplError::ParseError(format!("column {} not found", old_name))
    })?;
    field.name = new_name.to_string();
    for key in structure.primary_keys.iter_mut() {
        if key == old_name {
            *key = new_name.to_string();
        }
    }
    structure.preprocess()
}

/// Take a possibly-quoted, possibly db-qualified identifier off the front of
/// `s`; returns the identifier text and the remainder.
fn take_identifier(s: &str) -> CResult<(String, &str)> {
    let s = s.trim_start();
    let mut end = 0;
    let chars: Vec<char> = s.chars().collect();
    let mut in_quote: Option<char> = None;
    while end < chars.len() {
        let c = chars[end];
        if let Some(quote) = in_quote {
            if c == quote {
                in_quote = None;
            }
            end += 1;
            continue;
        }
        match c {
            '`' | '"' => {
                in_quote = Some(c);
                end += 1;
            }
            c if c.is_whitespace() || c == '(' => break,
            _ => end += 1,
        }
    }
    if end == 0 {
        return Err(ReplError::ParseError(format!(
            "expected identifier in: {}",
            s
        )));
    }
    let ident: String = chars[..end].iter().collect();
    let rest = &s[ident.len()..];
    Ok((ident, rest))
}

/// Last component of a possibly db-qualified identifier, unquoted.
fn table_name_of(token: &str) -> String {
    let name = token.rsplit('.').next().unwrap_or(token);
    let name = name.trim();
    let name = name.strip_prefix('`').unwrap_or(name);
    let name = name.strip_suffix('`').unwrap_or(name);
    let name = name.strip_prefix('"').unwrap_or(name);
    let name = name.strip_suffix('"').unwrap_or(name);
    name.to_string()
}
