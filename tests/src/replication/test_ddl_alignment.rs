//! After any accepted DDL the source and target structures must stay equal
//! in column count and names, with the target types dictated by the mapping
//! rules.

use common::config::Settings;
use common::pattern::PatternList;
use replication::converter::{MysqlToClickhouseConverter, TablesStructure};

fn converter() -> MysqlToClickhouseConverter {
    let mut settings = Settings::default();
    settings.databases = PatternList::Single("shop".to_string());
    MysqlToClickhouseConverter::new(settings, "shop", "shop")
}

fn assert_aligned(tables: &TablesStructure, table: &str) {
    let (mysql, ch) = &tables[table];
    assert_eq!(
        mysql.fields.len(),
        ch.fields.len(),
        "field counts diverged for {}",
        table
    );
    for (mysql_field, ch_field) in mysql.fields.iter().zip(ch.fields.iter()) {
        assert_eq!(mysql_field.name, ch_field.name);
    }
    assert_eq!(mysql.primary_keys, ch.primary_keys);
}

fn bootstrap(c: &MysqlToClickhouseConverter, ddl: &str) -> TablesStructure {
    let mut tables = TablesStructure::new();
    let (mysql, ch) = c.parse_create_table_query(ddl, &tables).unwrap();
    tables.insert(mysql.table_name.clone(), (mysql, ch));
    tables
}

#[test]
fn test_alignment_through_alter_sequence() {
    let c = converter();
    let mut tables = bootstrap(
        &c,
        "CREATE TABLE `users` (\
         `id` int NOT NULL,\
         `name` varchar(255),\
         PRIMARY KEY (`id`)) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
    );
    assert_aligned(&tables, "users");

    c.convert_alter_query(
        "ALTER TABLE users ADD COLUMN age int AFTER name",
        "shop",
        &mut tables,
    )
    .unwrap();
    assert_aligned(&tables, "users");
    assert_eq!(tables["users"].0.fields[2].name, "age");

    c.convert_alter_query(
        "ALTER TABLE users MODIFY COLUMN age bigint NOT NULL",
        "shop",
        &mut tables,
    )
    .unwrap();
    assert_aligned(&tables, "users");
    assert_eq!(tables["users"].1.fields[2].field_type, "Int64");

    c.convert_alter_query(
        "ALTER TABLE users CHANGE age years smallint",
        "shop",
        &mut tables,
    )
    .unwrap();
    assert_aligned(&tables, "users");
    assert_eq!(tables["users"].0.fields[2].name, "years");
    assert_eq!(tables["users"].1.fields[2].field_type, "Nullable(Int16)");

    c.convert_alter_query("ALTER TABLE users DROP COLUMN years", "shop", &mut tables)
        .unwrap();
    assert_aligned(&tables, "users");
    assert_eq!(tables["users"].0.fields.len(), 2);

    c.convert_alter_query(
        "ALTER TABLE users RENAME COLUMN name TO full_name",
        "shop",
        &mut tables,
    )
    .unwrap();
    assert_aligned(&tables, "users");
    assert_eq!(tables["users"].0.fields[1].name, "full_name");
}

#[test]
fn test_alignment_with_multi_operation_alter() {
    let c = converter();
    let mut tables = bootstrap(
        &c,
        "CREATE TABLE `t` (`id` int NOT NULL, PRIMARY KEY (`id`))",
    );

    let statements = c
        .convert_alter_query(
            "ALTER TABLE t \
             ADD COLUMN kind enum('A','B') NOT NULL, \
             ADD INDEX idx_kind (kind), \
             ADD COLUMN note varchar(64) DEFAULT 'n/a, really'",
            "shop",
            &mut tables,
        )
        .unwrap();
    // index operations produce no target statements
    assert_eq!(statements.len(), 2);
    assert_aligned(&tables, "t");
    assert_eq!(tables["t"].0.fields.len(), 3);
    // the enum labels are live for value conversion right away
    assert_eq!(
        tables["t"].0.fields[1].additional_data,
        Some(vec!["A".to_string(), "B".to_string()])
    );
    assert_eq!(
        tables["t"].1.fields[1].field_type,
        "Enum8('a' = 1, 'b' = 2)"
    );
}

#[test]
fn test_spec_scenario_add_column_after() {
    // start with t(id, name); add age after name; new rows carry age
    let c = converter();
    let mut tables = bootstrap(
        &c,
        "CREATE TABLE `t` (`id` int NOT NULL, `name` varchar(32), PRIMARY KEY (`id`))",
    );

    let statements = c
        .convert_alter_query(
            "ALTER TABLE `shop`.`t` ADD COLUMN `age` int AFTER name",
            "shop",
            &mut tables,
        )
        .unwrap();
    assert_eq!(
        statements,
        vec!["ALTER TABLE `shop`.`t` ADD COLUMN `age` Nullable(Int32) AFTER name"]
    );

    let (mysql, ch) = &tables["t"];
    assert_eq!(
        mysql.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
        vec!["id", "name", "age"]
    );
    assert_eq!(ch.fields[2].field_type, "Nullable(Int32)");
}
