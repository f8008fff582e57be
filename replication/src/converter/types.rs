//! Source -> target column type mapping.

use lazy_static::lazy_static;
use regex::Regex;

use common::err::{CResult, ReplError};
use common::schema::{TableField, TableStructure};

use super::enums::parse_mysql_enum;
use super::MysqlToClickhouseConverter;

lazy_static! {
    static ref DECIMAL_RE: Regex =
        Regex::new(r"^(?:numeric|decimal)\((\d+)\s*(?:,\s*(\d+))?\)").expect("valid pattern");
    static ref TIMESTAMP_RE: Regex =
        Regex::new(r"(?i)^timestamp(?:\((\d+)\))?$").expect("valid pattern");
}

/// `timestamp[(n)]` -> `DateTime64(...)`, annotated with the configured
/// source timezone when it is not UTC.
pub fn convert_timestamp_to_datetime64(input: &str, timezone: &str) -> CResult<String> {
    let captures = TIMESTAMP_RE.captures(input.trim()).ok_or_else(|| {
        ReplError::ParseError(format!("invalid timestamp type: {:?}", input))
    })?;
    let result = match (captures.get(1), timezone) {
        (Some(precision), "UTC") => format!("DateTime64({})", precision.as_str()),
        (Some(precision), tz) => format!("DateTime64({}, '{}')", precision.as_str(), tz),
        (None, "UTC") => "DateTime64".to_string(),
        (None, tz) => format!("DateTime64(3, '{}')", tz),
    };
    Ok(result)
}

impl MysqlToClickhouseConverter {
    /// Map a MySQL column type to the ClickHouse one, without nullability.
    /// User-provided overrides win over every built-in rule.
    pub fn convert_type(&self, mysql_type: &str, parameters: &str) -> CResult<String> {
        let is_unsigned = parameters.to_lowercase().contains("unsigned");

        if let Some(mapped) = self.settings.types_mapping.get(mysql_type) {
            return Ok(mapped.clone());
        }

        if mysql_type == "point" {
            return Ok("Tuple(x Float32, y Float32)".to_string());
        }
        if mysql_type == "polygon" {
            return Ok("Array(Tuple(x Float32, y Float32))".to_string());
        }

        // decimal/numeric: narrow scale-less types to plain integers
        if mysql_type.starts_with("numeric") || mysql_type.starts_with("decimal") {
            let (precision, scale) = if mysql_type.contains('(') {
                let captures = DECIMAL_RE.captures(mysql_type).ok_or_else(|| {
                    ReplError::ParseError(format!(
                        "invalid numeric type definition: {}",
                        mysql_type
                    ))
                })?;
                let precision: u32 = captures[1].parse()?;
                let scale: u32 = captures
                    .get(2)
                    .map(|m| m.as_str().parse())
                    .transpose()?
                    .unwrap_or(0);
                (precision, scale)
            } else {
                (10, 0)
            };

            if scale == 0 {
                return Ok(match (is_unsigned, precision) {
                    (true, 0..=9) => "UInt32".to_string(),
                    (true, 10..=18) => "UInt64".to_string(),
                    (false, 0..=9) => "Int32".to_string(),
                    (false, 10..=18) => "Int64".to_string(),
                    _ => format!("Decimal({}, {})", precision, scale),
                });
            }
            return Ok(format!("Decimal({}, {})", precision, scale));
        }

        match mysql_type {
            "int" | "integer" => {
                return Ok(if is_unsigned { "UInt32" } else { "Int32" }.to_string())
            }
            "bigint" => return Ok(if is_unsigned { "UInt64" } else { "Int64" }.to_string()),
            "double" | "real" => return Ok("Float64".to_string()),
            "float" => return Ok("Float32".to_string()),
            "date" => return Ok("Date32".to_string()),
            "tinyint(1)" | "bit(1)" | "bool" | "boolean" => return Ok("Bool".to_string()),
            "year" => return Ok("UInt16".to_string()),
            _ => {}
        }

        if mysql_type.contains("smallint") {
            return Ok(if is_unsigned { "UInt16" } else { "Int16" }.to_string());
        }
        if mysql_type.contains("tinyint") {
            return Ok(if is_unsigned { "UInt8" } else { "Int8" }.to_string());
        }
        if mysql_type.contains("mediumint") {
            return Ok(if is_unsigned { "UInt32" } else { "Int32" }.to_string());
        }
        if mysql_type.contains("datetime") {
            return Ok(mysql_type.replace("datetime", "DateTime64"));
        }
        if mysql_type.contains("longtext") || mysql_type.contains("varchar") {
            return Ok("String".to_string());
        }
        if mysql_type.starts_with("enum") {
            let enum_values = parse_mysql_enum(mysql_type)?;
            let labels = enum_values
                .iter()
                .enumerate()
                .map(|(idx, name)| format!("'{}' = {}", name.to_lowercase(), idx + 1))
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(if enum_values.len() <= 127 {
                format!("Enum8({})", labels)
            } else {
                format!("Enum16({})", labels)
            });
        }
        if mysql_type.contains("text")
            || mysql_type.contains("blob")
            || mysql_type.contains("char")
            || mysql_type.contains("json")
        {
            return Ok("String".to_string());
        }
        if mysql_type.contains("float") {
            return Ok("Float32".to_string());
        }
        if mysql_type.contains("double") || mysql_type.contains("real") {
            return Ok("Float64".to_string());
        }
        if mysql_type.contains("bigint") {
            return Ok(if is_unsigned { "UInt64" } else { "Int64" }.to_string());
        }
        if mysql_type.contains("integer") || mysql_type.contains("int(") {
            return Ok(if is_unsigned { "UInt32" } else { "Int32" }.to_string());
        }
        if mysql_type.starts_with("timestamp") {
            return convert_timestamp_to_datetime64(mysql_type, &self.settings.mysql_timezone);
        }
        if mysql_type.starts_with("time") {
            return Ok("String".to_string());
        }
        if mysql_type.contains("varbinary") || mysql_type.contains("binary") {
            return Ok("String".to_string());
        }
        if mysql_type.contains("set(") {
            return Ok("String".to_string());
        }

        Err(ReplError::UnknownType(format!(
            "unknown mysql type \"{}\"",
            mysql_type
        )))
    }

    /// Full column translation: type mapping plus `Nullable(...)` wrapping.
    /// Spatial tuple types are never nullable, they carry zero defaults.
    pub fn convert_field_type(&self, mysql_type: &str, mysql_parameters: &str) -> CResult<String> {
        let mysql_type = mysql_type.to_lowercase();
        let mysql_parameters = mysql_parameters.to_lowercase();
        let mut not_null = mysql_parameters.contains("not null");
        let clickhouse_type = self.convert_type(&mysql_type, &mysql_parameters)?;
        if clickhouse_type.contains("Tuple") {
            not_null = true;
        }
        if not_null {
            Ok(clickhouse_type)
        } else {
            Ok(format!("Nullable({})", clickhouse_type))
        }
    }

    /// Translate a whole source structure; field order and primary keys are
    /// carried over unchanged.
    pub fn convert_table_structure(
        &self,
        mysql_structure: &TableStructure,
    ) -> CResult<TableStructure> {
        let mut clickhouse_structure = TableStructure {
            table_name: mysql_structure.table_name.clone(),
            if_not_exists: mysql_structure.if_not_exists,
            ..Default::default()
        };
        for field in &mysql_structure.fields {
            let clickhouse_field_type =
                self.convert_field_type(&field.field_type, &field.parameters)?;
            clickhouse_structure.fields.push(TableField {
                name: field.name.clone(),
                field_type: clickhouse_field_type,
                parameters: String::new(),
                additional_data: None,
            });
        }
        clickhouse_structure.primary_keys = mysql_structure.primary_keys.clone();
        clickhouse_structure.preprocess()?;
        Ok(clickhouse_structure)
    }
}

#[cfg(test)]
mod tests {
    use common::config::Settings;

    use super::*;

    fn converter() -> MysqlToClickhouseConverter {
        MysqlToClickhouseConverter::new(Settings::default(), "db", "db")
    }

    #[test]
    fn test_integers() {
        let c = converter();
        assert_eq!(c.convert_type("int", "").unwrap(), "Int32");
        assert_eq!(c.convert_type("int", "unsigned").unwrap(), "UInt32");
        assert_eq!(c.convert_type("bigint", "").unwrap(), "Int64");
        assert_eq!(c.convert_type("smallint(5)", "unsigned").unwrap(), "UInt16");
        assert_eq!(c.convert_type("tinyint(4)", "").unwrap(), "Int8");
        assert_eq!(c.convert_type("mediumint(9)", "").unwrap(), "Int32");
        assert_eq!(c.convert_type("int(11)", "").unwrap(), "Int32");
    }

    #[test]
    fn test_booleans() {
        let c = converter();
        assert_eq!(c.convert_type("tinyint(1)", "").unwrap(), "Bool");
        assert_eq!(c.convert_type("bit(1)", "").unwrap(), "Bool");
        assert_eq!(c.convert_type("bool", "").unwrap(), "Bool");
    }

    #[test]
    fn test_decimal_narrowing() {
        let c = converter();
        assert_eq!(c.convert_type("decimal(5,2)", "").unwrap(), "Decimal(5, 2)");
        assert_eq!(c.convert_type("numeric(8,0)", "").unwrap(), "Int32");
        assert_eq!(c.convert_type("numeric(8,0)", "unsigned").unwrap(), "UInt32");
        assert_eq!(c.convert_type("decimal(15)", "").unwrap(), "Int64");
        assert_eq!(c.convert_type("numeric(30,0)", "").unwrap(), "Decimal(30, 0)");
        // no parameters: the precision-10 default lands in the 64-bit band
        assert_eq!(c.convert_type("decimal", "").unwrap(), "Int64");
    }

    #[test]
    fn test_dates_and_times() {
        let c = converter();
        assert_eq!(c.convert_type("date", "").unwrap(), "Date32");
        assert_eq!(c.convert_type("datetime(3)", "").unwrap(), "DateTime64(3)");
        assert_eq!(c.convert_type("timestamp", "").unwrap(), "DateTime64");
        assert_eq!(c.convert_type("time", "").unwrap(), "String");
        assert_eq!(c.convert_type("year", "").unwrap(), "UInt16");
    }

    #[test]
    fn test_timestamp_with_timezone() {
        let mut settings = Settings::default();
        settings.mysql_timezone = "Europe/London".to_string();
        let c = MysqlToClickhouseConverter::new(settings, "db", "db");
        assert_eq!(
            c.convert_type("timestamp(6)", "").unwrap(),
            "DateTime64(6, 'Europe/London')"
        );
        assert_eq!(
            c.convert_type("timestamp", "").unwrap(),
            "DateTime64(3, 'Europe/London')"
        );
    }

    #[test]
    fn test_strings_and_binary() {
        let c = converter();
        for mysql_type in [
            "varchar(255)",
            "char(10)",
            "text",
            "longtext",
            "json",
            "blob",
            "varbinary(16)",
            "binary(8)",
            "set('a','b')",
        ] {
            assert_eq!(c.convert_type(mysql_type, "").unwrap(), "String", "{}", mysql_type);
        }
    }

    #[test]
    fn test_enum() {
        let c = converter();
        assert_eq!(
            c.convert_type("enum('Purchase','Sell','Transfer')", "").unwrap(),
            "Enum8('purchase' = 1, 'sell' = 2, 'transfer' = 3)"
        );
    }

    #[test]
    fn test_enum16_for_large_sets() {
        let c = converter();
        let values = (0..130)
            .map(|i| format!("'v{}'", i))
            .collect::<Vec<_>>()
            .join(",");
        let result = c.convert_type(&format!("enum({})", values), "").unwrap();
        assert!(result.starts_with("Enum16("));
    }

    #[test]
    fn test_spatial() {
        let c = converter();
        assert_eq!(
            c.convert_type("point", "").unwrap(),
            "Tuple(x Float32, y Float32)"
        );
        assert_eq!(
            c.convert_type("polygon", "").unwrap(),
            "Array(Tuple(x Float32, y Float32))"
        );
    }

    #[test]
    fn test_user_override_wins() {
        let mut settings = Settings::default();
        settings
            .types_mapping
            .insert("char(36)".to_string(), "UUID".to_string());
        let c = MysqlToClickhouseConverter::new(settings, "db", "db");
        assert_eq!(c.convert_type("char(36)", "").unwrap(), "UUID");
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let c = converter();
        assert!(matches!(
            c.convert_type("geometrycollection", ""),
            Err(ReplError::UnknownType(_))
        ));
    }

    #[test]
    fn test_nullability_wrapping() {
        let c = converter();
        assert_eq!(
            c.convert_field_type("int", "NOT NULL").unwrap(),
            "Int32"
        );
        assert_eq!(c.convert_field_type("int", "").unwrap(), "Nullable(Int32)");
        // spatial types carry zero defaults instead of NULL
        assert_eq!(
            c.convert_field_type("point", "").unwrap(),
            "Tuple(x Float32, y Float32)"
        );
    }

    #[test]
    fn test_structure_conversion_keeps_alignment() {
        let c = converter();
        let mut mysql_structure = TableStructure {
            table_name: "t".to_string(),
            fields: vec![
                TableField {
                    name: "id".to_string(),
                    field_type: "int".to_string(),
                    parameters: "NOT NULL".to_string(),
                    additional_data: None,
                },
                TableField::new("name", "varchar(50)"),
            ],
            primary_keys: vec!["id".to_string()],
            ..Default::default()
        };
        mysql_structure.preprocess().unwrap();

        let ch = c.convert_table_structure(&mysql_structure).unwrap();
        assert_eq!(ch.fields.len(), mysql_structure.fields.len());
        assert_eq!(ch.fields[0].field_type, "Int32");
        assert_eq!(ch.fields[1].field_type, "Nullable(String)");
        assert_eq!(ch.primary_key_positions, vec![0]);
    }
}
