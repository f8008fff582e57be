use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A location in the source replication stream: binlog file name plus byte
/// offset. Binlog files are sequentially numbered with a `.NNNNNN` suffix
/// over a shared basename, so ordering compares the numeric suffix first and
/// the offset second.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    pub file: String,
    pub pos: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        BinlogPosition {
            file: file.into(),
            pos,
        }
    }

    /// Numeric suffix of the binlog file name (`mysql-bin.000123` -> 123).
    pub fn file_num(&self) -> Option<u64> {
        let (_, suffix) = self.file.rsplit_once('.')?;
        suffix.parse::<u64>().ok()
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.file == other.file {
            return self.pos.cmp(&other.pos);
        }
        match (self.file_num(), other.file_num()) {
            (Some(a), Some(b)) => a.cmp(&b).then(self.pos.cmp(&other.pos)),
            // malformed names, fall back to the lexical order
            _ => self
                .file
                .cmp(&other.file)
                .then(self.pos.cmp(&other.pos)),
        }
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// Row insert; updates are represented as an insert of the after-image
    Insert,
    /// Row delete carrying the before-image
    Delete,
    /// A DDL statement
    Query,
}

/// A self-describing column value as decoded from the replication stream.
/// Mirrors the shape of `mysql_common::Value`; interpretation (enum labels,
/// set masks, charsets, spatial payloads) is deferred to the translator,
/// which has the declared column types at hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Text(String),
    Date {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
    /// JSON document already rendered to text
    Json(String),
}

impl From<mysql_common::value::Value> for ColumnValue {
    fn from(value: mysql_common::value::Value) -> Self {
        use mysql_common::value::Value;
        match value {
            Value::NULL => ColumnValue::Null,
            Value::Bytes(bytes) => ColumnValue::Bytes(bytes),
            Value::Int(v) => ColumnValue::Int(v),
            Value::UInt(v) => ColumnValue::UInt(v),
            Value::Float(v) => ColumnValue::Float(v),
            Value::Double(v) => ColumnValue::Double(v),
            Value::Date(year, month, day, hour, minute, second, micros) => ColumnValue::Date {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            },
            Value::Time(negative, days, hours, minutes, seconds, micros) => ColumnValue::Time {
                negative,
                days,
                hours,
                minutes,
                seconds,
                micros,
            },
        }
    }
}

/// One record of the on-disk event log. Multi-row statements produce a
/// single event; ordering per source database follows `position`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub position: BinlogPosition,
    pub db_name: String,
    pub table_name: String,
    pub kind: EventKind,
    /// Row images in declared column order; empty for `Query` events
    pub rows: Vec<Vec<ColumnValue>>,
    /// DDL text for `Query` events, empty otherwise
    pub query: String,
}

impl LogEvent {
    pub fn query_event(
        position: BinlogPosition,
        db_name: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        LogEvent {
            position,
            db_name: db_name.into(),
            table_name: String::new(),
            kind: EventKind::Query,
            rows: Vec::new(),
            query: query.into(),
        }
    }

    pub fn row_event(
        position: BinlogPosition,
        db_name: impl Into<String>,
        table_name: impl Into<String>,
        kind: EventKind,
        rows: Vec<Vec<ColumnValue>>,
    ) -> Self {
        LogEvent {
            position,
            db_name: db_name.into(),
            table_name: table_name.into(),
            kind,
            rows,
            query: String::new(),
        }
    }
}
