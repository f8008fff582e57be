//! End-to-end translation scenarios: a CREATE TABLE statement is parsed the
//! way the snapshotter does it, then row images are converted the way the
//! realtime applier does.

use common::config::Settings;
use common::event::ColumnValue;
use common::pattern::PatternList;
use replication::converter::{record_id, MysqlToClickhouseConverter, TablesStructure};
use serde_json::json;

fn converter() -> MysqlToClickhouseConverter {
    let mut settings = Settings::default();
    settings.databases = PatternList::Single("shop".to_string());
    MysqlToClickhouseConverter::new(settings, "shop", "shop")
}

fn bootstrap(c: &MysqlToClickhouseConverter, ddl: &str) -> TablesStructure {
    let mut tables = TablesStructure::new();
    let (mysql, ch) = c.parse_create_table_query(ddl, &tables).unwrap();
    tables.insert(mysql.table_name.clone(), (mysql, ch));
    tables
}

#[test]
fn test_enum_values_lowercased() {
    let c = converter();
    let tables = bootstrap(
        &c,
        "CREATE TABLE `deals` (\
         `id` int NOT NULL,\
         `kind` enum('Purchase','Sell','Transfer') NOT NULL,\
         PRIMARY KEY (`id`))",
    );
    let (mysql, ch) = &tables["deals"];
    assert_eq!(
        ch.fields[1].field_type,
        "Enum8('purchase' = 1, 'sell' = 2, 'transfer' = 3)"
    );

    // binlog delivers the 1-based index
    for (index, expected) in [(1, "purchase"), (2, "sell"), (3, "transfer")] {
        let row = vec![ColumnValue::Int(1), ColumnValue::Int(index)];
        let converted = c.convert_record(&row, mysql, ch, false).unwrap();
        assert_eq!(converted[1], json!(expected));
    }
}

#[test]
fn test_invalid_datetime_becomes_epoch() {
    let c = converter();
    let tables = bootstrap(
        &c,
        "CREATE TABLE `events` (\
         `id` int NOT NULL,\
         `modified_date` datetime NOT NULL,\
         PRIMARY KEY (`id`))",
    );
    let (mysql, ch) = &tables["events"];

    let row = vec![
        ColumnValue::Int(1),
        ColumnValue::Date {
            year: 0,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            second: 0,
            micros: 0,
        },
    ];
    let converted = c.convert_record(&row, mysql, ch, false).unwrap();
    assert_eq!(converted[1], json!("1970-01-01 00:00:00"));
}

#[test]
fn test_composite_primary_key_delete_keys() {
    // six rows keyed by (departments, termine); deleting three departments
    // must produce exactly the matching key tuples
    let c = converter();
    let tables = bootstrap(
        &c,
        "CREATE TABLE `plan` (\
         `departments` int NOT NULL,\
         `termine` int NOT NULL,\
         `data` varchar(50),\
         PRIMARY KEY (`departments`,`termine`))",
    );
    let (mysql, ch) = &tables["plan"];

    let rows: Vec<Vec<ColumnValue>> = [(10, 20), (30, 40), (50, 60), (20, 10), (40, 30), (60, 50)]
        .iter()
        .map(|(d, t)| {
            vec![
                ColumnValue::Int(*d),
                ColumnValue::Int(*t),
                ColumnValue::Bytes(b"x".to_vec()),
            ]
        })
        .collect();

    let deleted: Vec<String> = rows
        .iter()
        .filter(|row| matches!(row[0], ColumnValue::Int(d) if [10, 30, 50].contains(&d)))
        .map(|row| {
            let converted = c.convert_record(row, mysql, ch, true).unwrap();
            record_id(ch, &converted)
        })
        .collect();
    assert_eq!(deleted, vec!["10,20", "30,40", "50,60"]);
}

#[test]
fn test_insert_then_delete_key_identity() {
    // the key derived from a full insert image and from a delete image (with
    // only the primary key converted) must be identical, otherwise pending
    // buffers could not cancel each other
    let c = converter();
    let tables = bootstrap(
        &c,
        "CREATE TABLE `users` (\
         `code` varchar(8) NOT NULL,\
         `age` int,\
         PRIMARY KEY (`code`))",
    );
    let (mysql, ch) = &tables["users"];

    let row = vec![
        ColumnValue::Bytes(b"ivan".to_vec()),
        ColumnValue::Int(42),
    ];
    let insert_key = record_id(ch, &c.convert_record(&row, mysql, ch, false).unwrap());
    let delete_key = record_id(ch, &c.convert_record(&row, mysql, ch, true).unwrap());
    assert_eq!(insert_key, delete_key);
    assert_eq!(insert_key, "'ivan'");
}

#[test]
fn test_unsigned_and_year_round_trip() {
    let c = converter();
    let tables = bootstrap(
        &c,
        "CREATE TABLE `metrics` (\
         `id` int unsigned NOT NULL,\
         `produced` year,\
         PRIMARY KEY (`id`))",
    );
    let (mysql, ch) = &tables["metrics"];
    assert_eq!(ch.fields[0].field_type, "UInt32");
    assert_eq!(ch.fields[1].field_type, "Nullable(UInt16)");

    let row = vec![ColumnValue::Int(-1), ColumnValue::Int(2024)];
    let converted = c.convert_record(&row, mysql, ch, false).unwrap();
    assert_eq!(converted[0], json!(4_294_967_295u64));
    assert_eq!(converted[1], json!(2024));
}

#[test]
fn test_timezone_annotation_flows_from_config() {
    let mut settings = Settings::default();
    settings.databases = PatternList::Single("shop".to_string());
    settings.mysql_timezone = "America/New_York".to_string();
    let c = MysqlToClickhouseConverter::new(settings, "shop", "shop");

    let tables = bootstrap(
        &c,
        "CREATE TABLE `audit` (\
         `id` int NOT NULL,\
         `seen_at` timestamp(3) NOT NULL,\
         PRIMARY KEY (`id`))",
    );
    assert_eq!(
        tables["audit"].1.fields[1].field_type,
        "DateTime64(3, 'America/New_York')"
    );
}

#[test]
fn test_filtered_database_produces_no_ddl() {
    let c = converter();
    let mut tables = TablesStructure::new();
    let statements = c
        .convert_alter_query(
            "ALTER TABLE `analytics`.`t` ADD COLUMN c int",
            "analytics",
            &mut tables,
        )
        .unwrap();
    assert!(statements.is_empty());
    assert!(tables.is_empty());
}

#[test]
fn test_truncate_and_drop_shapes_are_parsed_by_realtime_layer() {
    // the applier splits these statements itself; the converter only maps
    // the identifiers, so the mapping must hold for both spellings
    let c = converter();
    let (db, table, matches) = c.get_db_and_table_name("`shop`.`users`", "shop");
    assert_eq!((db.as_str(), table.as_str(), matches), ("shop", "users", true));
    let (db, table, matches) = c.get_db_and_table_name("users", "shop");
    assert_eq!((db.as_str(), table.as_str(), matches), ("shop", "users", true));
}
