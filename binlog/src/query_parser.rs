use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Matches "CREATE TABLE" / "ALTER TABLE" (optional "IF NOT EXISTS") with
    // an optional database qualifier before the table name. The qualifier is
    // either quoted with backticks/double quotes (may contain special
    // characters) or a plain identifier; whitespace around the dot is
    // allowed and the statement may span multiple lines.
    static ref DB_NAME_RE: Regex = Regex::new(
        r#"(?isx)
        ^\s*
        (?:create|alter)\s+table\s+
        (?:if\s+not\s+exists\s+)?
        (?:(?:[`"](?P<quoted>[^`"]+)[`"]|(?P<unquoted>[a-zA-Z0-9_]+))\s*\.\s*)?
        [`"]?[a-zA-Z0-9_]+[`"]?
        "#
    )
    .expect("db name pattern is valid");
}

/// Extract the database name from a CREATE TABLE / ALTER TABLE statement.
/// Returns an empty string when the statement carries no database qualifier
/// (the caller then falls back to the session default schema).
pub fn try_parse_db_name_from_query(query: &str) -> String {
    match DB_NAME_RE.captures(query) {
        Some(captures) => captures
            .name("quoted")
            .or_else(|| captures.name("unquoted"))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        None => String::new(),
    }
}
