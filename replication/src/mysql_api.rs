use std::time::{Duration, Instant};

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Row};

use common::config::MysqlSettings;
use common::err::{CResult, ReplError};
use common::event::ColumnValue;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Thin wrapper over the MySQL connection used by the snapshotter:
/// schema listings and keyset-paged full table scans.
pub struct MySQLApi {
    database: Option<String>,
    settings: MysqlSettings,
    conn: Option<Conn>,
    last_connect_time: Option<Instant>,
}

impl MySQLApi {
    pub fn new(database: Option<String>, settings: &MysqlSettings) -> Self {
        MySQLApi {
            database,
            settings: settings.clone(),
            conn: None,
            last_connect_time: None,
        }
    }

    fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.settings.host.clone())
            .tcp_port(self.settings.port)
            .user(Some(self.settings.user.clone()))
            .pass(Some(self.settings.password.clone()))
            .into()
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.disconnect().await;
        }
        self.last_connect_time = None;
    }

    /// Long-lived connections are recycled every few minutes; some listings
    /// (new databases) only show up on a fresh connection.
    async fn reconnect_if_required(&mut self, force: bool) -> CResult<&mut Conn> {
        let stale = match self.last_connect_time {
            Some(at) => at.elapsed() >= RECONNECT_INTERVAL,
            None => true,
        };
        if force || stale || self.conn.is_none() {
            if let Some(conn) = self.conn.take() {
                let _ = conn.disconnect().await;
            }
            let mut conn = Conn::new(self.opts()).await?;
            if let Some(database) = &self.database {
                conn.query_drop(format!("USE `{}`", database)).await?;
            }
            self.conn = Some(conn);
            self.last_connect_time = Some(Instant::now());
        }
        self.conn
            .as_mut()
            .ok_or_else(|| ReplError::TransientSource("not connected".to_string()))
    }

    pub async fn set_database(&mut self, database: &str) -> CResult<()> {
        self.database = Some(database.to_string());
        let conn = self.reconnect_if_required(false).await?;
        conn.query_drop(format!("USE `{}`", database)).await?;
        Ok(())
    }

    pub async fn get_databases(&mut self) -> CResult<Vec<String>> {
        // new databases appear only on a new connection
        let conn = self.reconnect_if_required(true).await?;
        let names: Vec<String> = conn.query("SHOW DATABASES").await?;
        Ok(names)
    }

    /// Base tables of the current database; views are not replicated.
    pub async fn get_tables(&mut self) -> CResult<Vec<String>> {
        let conn = self.reconnect_if_required(false).await?;
        let rows: Vec<(String, String)> = conn.query("SHOW FULL TABLES").await?;
        Ok(rows
            .into_iter()
            .filter(|(_, kind)| kind == "BASE TABLE")
            .map(|(name, _)| name)
            .collect())
    }

    pub async fn get_binlog_files(&mut self) -> CResult<Vec<String>> {
        let conn = self.reconnect_if_required(false).await?;
        let rows: Vec<Row> = conn.query("SHOW BINARY LOGS").await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get::<String, _>(0))
            .collect())
    }

    pub async fn get_table_create_statement(&mut self, table_name: &str) -> CResult<String> {
        let conn = self.reconnect_if_required(false).await?;
        let row: Option<(String, String)> = conn
            .query_first(format!("SHOW CREATE TABLE `{}`", table_name))
            .await?;
        let (_, create_statement) = row.ok_or_else(|| {
            ReplError::TransientSource(format!("no CREATE TABLE for {}", table_name))
        })?;
        Ok(create_statement.trim().to_string())
    }

    /// One page of a keyset scan:
    /// `SELECT * FROM t WHERE (pk...) > (cursor...) ORDER BY pk... LIMIT n`.
    /// In parallel snapshot mode every worker additionally restricts the
    /// scan to its own hash partition of the key space.
    pub async fn get_records(
        &mut self,
        table_name: &str,
        order_by: &[String],
        limit: u64,
        start_value: Option<&[ColumnValue]>,
        worker: Option<(u32, u32)>,
    ) -> CResult<Vec<Vec<ColumnValue>>> {
        let order_by_list = order_by
            .iter()
            .map(|name| format!("`{}`", name))
            .collect::<Vec<_>>()
            .join(",");

        let mut conditions = Vec::new();
        if let Some(values) = start_value {
            let literals = values
                .iter()
                .map(render_sql_literal)
                .collect::<Vec<_>>()
                .join(",");
            conditions.push(format!("({}) > ({})", order_by_list, literals));
        }
        if let Some((worker_id, total_workers)) = worker {
            conditions.push(format!(
                "CRC32(CONCAT_WS(',', {})) % {} = {}",
                order_by_list, total_workers, worker_id
            ));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {} ", conditions.join(" AND "))
        };
        let query = format!(
            "SELECT * FROM `{}` {}ORDER BY {} LIMIT {}",
            table_name, where_clause, order_by_list, limit
        );

        let conn = self.reconnect_if_required(false).await?;
        let rows: Vec<Row> = conn.query(query).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(ColumnValue::from).collect())
            .collect())
    }
}

/// Render a raw column value as a MySQL literal for the keyset cursor.
pub fn render_sql_literal(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => "NULL".to_string(),
        ColumnValue::Int(v) => v.to_string(),
        ColumnValue::UInt(v) => v.to_string(),
        ColumnValue::Float(v) => v.to_string(),
        ColumnValue::Double(v) => v.to_string(),
        ColumnValue::Bytes(bytes) => quote_string(&String::from_utf8_lossy(bytes)),
        ColumnValue::Text(text) => quote_string(text),
        ColumnValue::Json(text) => quote_string(text),
        ColumnValue::Date {
            year,
            month,
            day,
            hour,
            minute,
            second,
            ..
        } => format!(
            "'{:04}-{:02}-{:02} {:02}:{:02}:{:02}'",
            year, month, day, hour, minute, second
        ),
        ColumnValue::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            ..
        } => format!(
            "'{}{}:{:02}:{:02}'",
            if *negative { "-" } else { "" },
            days * 24 + *hours as u32,
            minutes,
            seconds
        ),
    }
}

fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_rendering() {
        assert_eq!(render_sql_literal(&ColumnValue::Int(-5)), "-5");
        assert_eq!(render_sql_literal(&ColumnValue::UInt(7)), "7");
        assert_eq!(render_sql_literal(&ColumnValue::Null), "NULL");
        assert_eq!(
            render_sql_literal(&ColumnValue::Text("it's".to_string())),
            "'it\\'s'"
        );
    }

    #[test]
    fn test_date_literal() {
        let value = ColumnValue::Date {
            year: 2024,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
            micros: 0,
        };
        assert_eq!(render_sql_literal(&value), "'2024-01-02 03:04:05'");
    }
}
