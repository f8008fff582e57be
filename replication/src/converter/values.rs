//! Row value conversion from decoded binlog/query values into the JSON
//! representation the target writer sends to ClickHouse.

use std::cmp::Ordering;
use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive};
use serde_json::{json, Value as JsonValue};
use tracing::{error, warn};

use common::err::{CResult, ReplError};
use common::event::ColumnValue;
use common::schema::TableStructure;

use super::charset::decode_text;
use super::spatial::{parse_mysql_point, parse_mysql_polygon};
use super::MysqlToClickhouseConverter;

const EPOCH_DATE: &str = "1970-01-01";
const EPOCH_DATETIME: &str = "1970-01-01 00:00:00";

impl MysqlToClickhouseConverter {
    pub fn convert_records(
        &self,
        records: &[Vec<ColumnValue>],
        mysql_structure: &TableStructure,
        clickhouse_structure: &TableStructure,
        only_primary: bool,
    ) -> CResult<Vec<Vec<JsonValue>>> {
        records
            .iter()
            .map(|record| {
                self.convert_record(record, mysql_structure, clickhouse_structure, only_primary)
            })
            .collect()
    }

    /// Convert one row. With `only_primary` only the primary-key columns are
    /// converted (delete events carry the full before-image but only the key
    /// is needed); other columns come out as nulls.
    pub fn convert_record(
        &self,
        record: &[ColumnValue],
        mysql_structure: &TableStructure,
        clickhouse_structure: &TableStructure,
        only_primary: bool,
    ) -> CResult<Vec<JsonValue>> {
        if record.len() != mysql_structure.fields.len() {
            return Err(ReplError::Fatal(format!(
                "row of {} values does not match structure of {} ({} fields)",
                record.len(),
                mysql_structure.table_name,
                mysql_structure.fields.len()
            )));
        }

        let mut result = Vec::with_capacity(record.len());
        for (idx, value) in record.iter().enumerate() {
            if only_primary && !mysql_structure.primary_key_positions.contains(&idx) {
                result.push(JsonValue::Null);
                continue;
            }
            let mysql_field = &mysql_structure.fields[idx];
            let mysql_type = mysql_field.field_type.to_lowercase();
            let clickhouse_type = clickhouse_structure.fields[idx].field_type.as_str();
            result.push(self.convert_value(
                value,
                &mysql_type,
                clickhouse_type,
                mysql_structure,
                idx,
            )?);
        }
        Ok(result)
    }

    fn convert_value(
        &self,
        value: &ColumnValue,
        mysql_type: &str,
        clickhouse_type: &str,
        mysql_structure: &TableStructure,
        idx: usize,
    ) -> CResult<JsonValue> {
        // spatial columns carry zero-valued defaults instead of NULL
        if mysql_type.starts_with("point") {
            let bytes = value_bytes(value);
            let (x, y) = parse_mysql_point(bytes)?;
            return Ok(json!([x, y]));
        }
        if mysql_type.starts_with("polygon") {
            let bytes = value_bytes(value);
            let points: Vec<[f64; 2]> = parse_mysql_polygon(bytes)?
                .into_iter()
                .map(|(x, y)| [x, y])
                .collect();
            return Ok(json!(points));
        }

        if matches!(value, ColumnValue::Null) {
            return Ok(JsonValue::Null);
        }

        if mysql_type.starts_with("time")
            && !mysql_type.starts_with("timestamp")
            && clickhouse_type.contains("String")
        {
            return Ok(JsonValue::String(render_time(value)));
        }

        if mysql_type.contains("json") && clickhouse_type.contains("String") {
            return Ok(JsonValue::String(match value {
                ColumnValue::Json(text) => text.clone(),
                ColumnValue::Text(text) => text.clone(),
                ColumnValue::Bytes(bytes) => String::from_utf8_lossy(bytes).to_string(),
                other => render_plain(other),
            }));
        }

        if clickhouse_type.contains("UUID") {
            if let Some(text) = value_text(value) {
                if text.len() == 36 {
                    if let Ok(parsed) = uuid::Uuid::from_str(&text) {
                        return Ok(JsonValue::String(parsed.to_string()));
                    }
                }
            }
        }

        if let ColumnValue::Int(v) = value {
            if *v < 0 {
                // two's-complement rebase into the unsigned representation
                if mysql_type.contains("mediumint") {
                    return Ok(json!(16_777_216 + v));
                }
                if clickhouse_type.contains("UInt8") {
                    return Ok(json!(256 + v));
                }
                if clickhouse_type.contains("UInt16") {
                    return Ok(json!(65_536 + v));
                }
                if clickhouse_type.contains("UInt32") {
                    return Ok(json!(4_294_967_296i64 + v));
                }
                if clickhouse_type.contains("UInt64") {
                    return Ok(json!(*v as u64));
                }
            }
        }

        if clickhouse_type.contains("String")
            && (mysql_type.contains("text") || mysql_type.contains("char"))
        {
            if let ColumnValue::Bytes(bytes) = value {
                return Ok(JsonValue::String(decode_text(
                    bytes,
                    &mysql_structure.charset,
                )));
            }
        }

        if mysql_type.contains("set(") {
            return Ok(self.convert_set_value(value, mysql_structure, idx));
        }

        if mysql_type.starts_with("enum(") {
            return Ok(self.convert_enum_value(value, mysql_structure, idx));
        }

        if mysql_type == "year" {
            let year = match value {
                ColumnValue::Int(v) => *v,
                ColumnValue::UInt(v) => *v as i64,
                ColumnValue::Text(text) => text.parse::<i64>().unwrap_or(0),
                ColumnValue::Bytes(bytes) => String::from_utf8_lossy(bytes)
                    .parse::<i64>()
                    .unwrap_or(0),
                other => return Ok(render_json(other)),
            };
            return Ok(json!(year.clamp(1901, 2155)));
        }

        if (mysql_type.starts_with("decimal") || mysql_type.starts_with("numeric"))
            && !clickhouse_type.contains("Decimal")
        {
            // scale-less decimals were narrowed to plain integer columns
            if let Some(text) = value_text(value) {
                if let Ok(decimal) = BigDecimal::from_str(text.trim()) {
                    if clickhouse_type.contains("UInt") {
                        if let Some(v) = decimal.to_u64() {
                            return Ok(json!(v));
                        }
                    } else if let Some(v) = decimal.to_i64() {
                        return Ok(json!(v));
                    }
                }
            }
        }

        if let ColumnValue::Date { .. } = value {
            return Ok(JsonValue::String(render_date(value, clickhouse_type)));
        }

        Ok(render_json(value))
    }

    fn convert_set_value(
        &self,
        value: &ColumnValue,
        mysql_structure: &TableStructure,
        idx: usize,
    ) -> JsonValue {
        let empty = Vec::new();
        let set_values = mysql_structure.fields[idx]
            .additional_data
            .as_ref()
            .unwrap_or(&empty);
        match value {
            ColumnValue::Int(_) | ColumnValue::UInt(_) => {
                let bit_mask = match value {
                    ColumnValue::Int(v) => *v as u64,
                    ColumnValue::UInt(v) => *v,
                    _ => 0,
                };
                let labels: Vec<&str> = set_values
                    .iter()
                    .enumerate()
                    .filter(|(bit, _)| bit_mask & (1u64 << bit) != 0)
                    .map(|(_, label)| label.as_str())
                    .collect();
                JsonValue::String(labels.join(","))
            }
            // the text protocol already delivers the joined labels
            ColumnValue::Text(text) => JsonValue::String(text.clone()),
            ColumnValue::Bytes(bytes) => {
                JsonValue::String(String::from_utf8_lossy(bytes).to_string())
            }
            other => render_json(other),
        }
    }

    fn convert_enum_value(
        &self,
        value: &ColumnValue,
        mysql_structure: &TableStructure,
        idx: usize,
    ) -> JsonValue {
        let field = &mysql_structure.fields[idx];
        let empty = Vec::new();
        let enum_values = field.additional_data.as_ref().unwrap_or(&empty);
        let index = match value {
            ColumnValue::Int(v) => Some(*v),
            ColumnValue::UInt(v) => Some(*v as i64),
            _ => None,
        };

        if let Some(index) = index {
            if index == 0 {
                // index 0 is MySQL's empty-value marker, passed through
                return json!(0);
            }
            if index < 1 || index as usize > enum_values.len() {
                error!(
                    "invalid enum index {} for field '{}' with values {:?}",
                    index, field.name, enum_values
                );
                return json!(index);
            }
            return JsonValue::String(enum_values[index as usize - 1].to_lowercase());
        }

        let text = match value {
            ColumnValue::Text(text) => text.clone(),
            ColumnValue::Bytes(bytes) => String::from_utf8_lossy(bytes).to_string(),
            other => return render_json(other),
        };
        if enum_values
            .iter()
            .any(|label| label.eq_ignore_ascii_case(&text))
        {
            return JsonValue::String(text.to_lowercase());
        }
        error!(
            "invalid enum value '{}' not in {:?} for field '{}'",
            text, enum_values, field.name
        );
        JsonValue::String(text)
    }
}

fn value_bytes(value: &ColumnValue) -> Option<&[u8]> {
    match value {
        ColumnValue::Bytes(bytes) => Some(bytes.as_slice()),
        _ => None,
    }
}

fn value_text(value: &ColumnValue) -> Option<String> {
    match value {
        ColumnValue::Text(text) => Some(text.clone()),
        ColumnValue::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        _ => None,
    }
}

fn render_time(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        } => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = days * 24 + *hours as u32;
            if *micros > 0 {
                format!(
                    "{}{}:{:02}:{:02}.{:06}",
                    sign, total_hours, minutes, seconds, micros
                )
            } else {
                format!("{}{}:{:02}:{:02}", sign, total_hours, minutes, seconds)
            }
        }
        other => render_plain(other),
    }
}

/// Render a date/datetime value for the given target type; anything the
/// target cannot represent collapses to the epoch.
fn render_date(value: &ColumnValue, clickhouse_type: &str) -> String {
    let date_only = clickhouse_type.contains("Date32");
    if let ColumnValue::Date {
        year,
        month,
        day,
        hour,
        minute,
        second,
        micros,
    } = value
    {
        // the target date types cover 1900..2299; anything else (zero
        // dates included) is not representable
        let valid = (1900..=2299).contains(year)
            && chrono::NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .is_some();
        if !valid {
            warn!("invalid date value {:?}, replaced with epoch", value);
            return if date_only {
                EPOCH_DATE.to_string()
            } else {
                EPOCH_DATETIME.to_string()
            };
        }
        if date_only {
            return format!("{:04}-{:02}-{:02}", year, month, day);
        }
        if *micros > 0 {
            return format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                year, month, day, hour, minute, second, micros
            );
        }
        return format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        );
    }
    render_plain(value)
}

fn render_plain(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => String::new(),
        ColumnValue::Int(v) => v.to_string(),
        ColumnValue::UInt(v) => v.to_string(),
        ColumnValue::Float(v) => v.to_string(),
        ColumnValue::Double(v) => v.to_string(),
        ColumnValue::Bytes(bytes) => String::from_utf8_lossy(bytes).to_string(),
        ColumnValue::Text(text) => text.clone(),
        ColumnValue::Json(text) => text.clone(),
        date @ ColumnValue::Date { .. } => render_date(date, "DateTime64"),
        time @ ColumnValue::Time { .. } => render_time(time),
    }
}

/// Default JSON rendering for values with no type-specific rule.
fn render_json(value: &ColumnValue) -> JsonValue {
    match value {
        ColumnValue::Null => JsonValue::Null,
        ColumnValue::Int(v) => json!(v),
        ColumnValue::UInt(v) => json!(v),
        ColumnValue::Float(v) => serde_json::Number::from_f64(*v as f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ColumnValue::Double(v) => serde_json::Number::from_f64(*v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ColumnValue::Bytes(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).to_string()),
        ColumnValue::Text(text) => JsonValue::String(text.clone()),
        ColumnValue::Json(text) => JsonValue::String(text.clone()),
        date @ ColumnValue::Date { .. } => JsonValue::String(render_plain(date)),
        time @ ColumnValue::Time { .. } => JsonValue::String(render_time(time)),
    }
}

/// Deterministic key string of a converted row, built from the primary-key
/// columns. String-typed fields are quoted so the result can be used
/// directly inside `DELETE ... WHERE (pk) IN (...)`.
pub fn record_id(clickhouse_structure: &TableStructure, record: &[JsonValue]) -> String {
    let mut parts = Vec::with_capacity(clickhouse_structure.primary_key_positions.len());
    for idx in &clickhouse_structure.primary_key_positions {
        let field_type = &clickhouse_structure.fields[*idx].field_type;
        let value = record.get(*idx).unwrap_or(&JsonValue::Null);
        let rendered = match value {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        };
        if field_type.contains("String") {
            parts.push(format!("'{}'", rendered));
        } else {
            parts.push(rendered);
        }
    }
    parts.join(",")
}

/// Order raw primary-key tuples for keyset pagination cursors.
pub fn compare_values(a: &[ColumnValue], b: &[ColumnValue]) -> Ordering {
    for (left, right) in a.iter().zip(b.iter()) {
        let ordering = compare_single(left, right);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_single(a: &ColumnValue, b: &ColumnValue) -> Ordering {
    use ColumnValue::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Int(x), Int(y)) => x.cmp(y),
        (UInt(x), UInt(y)) => x.cmp(y),
        (Int(x), UInt(y)) => {
            if *x < 0 {
                Ordering::Less
            } else {
                (*x as u64).cmp(y)
            }
        }
        (UInt(x), Int(y)) => compare_single(&Int(*y), &UInt(*x)).reverse(),
        (Text(x), Text(y)) => x.cmp(y),
        (Bytes(x), Bytes(y)) => x.cmp(y),
        (Text(x), Bytes(y)) => x.as_bytes().cmp(y.as_slice()),
        (Bytes(x), Text(y)) => x.as_slice().cmp(y.as_bytes()),
        (
            Date {
                year: y1,
                month: m1,
                day: d1,
                hour: h1,
                minute: mi1,
                second: s1,
                micros: us1,
            },
            Date {
                year: y2,
                month: m2,
                day: d2,
                hour: h2,
                minute: mi2,
                second: s2,
                micros: us2,
            },
        ) => (y1, m1, d1, h1, mi1, s1, us1).cmp(&(y2, m2, d2, h2, mi2, s2, us2)),
        (x, y) => {
            // mixed numeric kinds fall back to float comparison
            let xf = numeric_value(x);
            let yf = numeric_value(y);
            match (xf, yf) {
                (Some(xf), Some(yf)) => xf.partial_cmp(&yf).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            }
        }
    }
}

fn numeric_value(value: &ColumnValue) -> Option<f64> {
    match value {
        ColumnValue::Int(v) => Some(*v as f64),
        ColumnValue::UInt(v) => Some(*v as f64),
        ColumnValue::Float(v) => Some(*v as f64),
        ColumnValue::Double(v) => Some(*v),
        _ => None,
    }
}
