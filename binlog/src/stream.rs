use futures_util::StreamExt;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, OptsBuilder};
use mysql_common::binlog::events::{EventData, RowsEventData, TableMapEvent};
use mysql_common::binlog::row::BinlogRow;
use mysql_common::binlog::value::BinlogValue;
use rand::Rng;
use tracing::{debug, warn};

use common::config::MysqlSettings;
use common::err::{CResult, ReplError};
use common::event::{BinlogPosition, ColumnValue, EventKind};

/// A classified event pulled from the replication stream.
#[derive(Debug)]
pub enum SourceEvent {
    Rows {
        db_name: String,
        table_name: String,
        kind: EventKind,
        rows: Vec<Vec<ColumnValue>>,
    },
    Query {
        /// session default schema of the connection that issued the statement
        db_name: String,
        query: String,
    },
    /// anything the replicator does not persist (rotations, xid, gtid, ...)
    Other,
}

/// Wraps the MySQL binlog subscription and decodes raw stream events into
/// [`SourceEvent`]s with their positions.
pub struct BinlogSource {
    stream: BinlogStream,
    current_file: String,
}

fn build_opts(settings: &MysqlSettings) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(settings.host.clone())
        .tcp_port(settings.port)
        .user(Some(settings.user.clone()))
        .pass(Some(settings.password.clone()))
        .into()
}

/// `SHOW MASTER STATUS`: the current end of the source stream.
async fn fetch_master_status(conn: &mut Conn) -> CResult<BinlogPosition> {
    let row: Option<mysql_async::Row> = conn
        .query_first("SHOW MASTER STATUS")
        .await
        .map_err(|err| ReplError::TransientSource(err.to_string()))?;
    let row =
        row.ok_or_else(|| ReplError::TransientSource("empty SHOW MASTER STATUS".to_string()))?;
    let file: Option<String> = row.get(0);
    let pos: Option<u64> = row.get(1);
    match (file, pos) {
        (Some(file), Some(pos)) => Ok(BinlogPosition::new(file, pos)),
        _ => Err(ReplError::TransientSource(
            "unexpected SHOW MASTER STATUS row".to_string(),
        )),
    }
}

impl BinlogSource {
    /// Open the replication subscription. `position == None` subscribes from
    /// the current stream end.
    pub async fn connect(
        settings: &MysqlSettings,
        position: Option<&BinlogPosition>,
    ) -> CResult<Self> {
        let mut conn = Conn::new(build_opts(settings)).await?;

        let start = match position {
            Some(position) => position.clone(),
            None => fetch_master_status(&mut conn).await?,
        };

        let server_id = rand::thread_rng().gen_range(1..u32::MAX - 1);
        let request = BinlogStreamRequest::new(server_id)
            .with_filename(start.file.as_bytes())
            .with_pos(start.pos);

        let stream = conn.get_binlog_stream(request).await?;
        Ok(BinlogSource {
            stream,
            current_file: start.file,
        })
    }

    /// Pull and classify the next stream event. `None` means the stream
    /// ended (connection closed by the server).
    pub async fn read_event(&mut self) -> CResult<Option<(BinlogPosition, SourceEvent)>> {
        let event = match self.stream.next().await {
            Some(event) => event?,
            None => return Ok(None),
        };

        let log_pos = event.header().log_pos() as u64;
        let data = match event.read_data() {
            Ok(Some(data)) => data,
            Ok(None) => {
                return Ok(Some((
                    BinlogPosition::new(self.current_file.clone(), log_pos),
                    SourceEvent::Other,
                )))
            }
            Err(err) => {
                warn!("undecodable binlog event: {}", err);
                return Ok(Some((
                    BinlogPosition::new(self.current_file.clone(), log_pos),
                    SourceEvent::Other,
                )));
            }
        };

        let source_event = match data {
            EventData::RotateEvent(rotate) => {
                let name = rotate.name().to_string();
                if name != self.current_file {
                    debug!("binlog rotated to {}", name);
                    self.current_file = name;
                }
                SourceEvent::Other
            }
            EventData::QueryEvent(query_event) => {
                let query = query_event.query().to_string();
                // transaction bookkeeping travels as query events too
                if query.eq_ignore_ascii_case("BEGIN") || query.eq_ignore_ascii_case("COMMIT") {
                    SourceEvent::Other
                } else {
                    SourceEvent::Query {
                        db_name: query_event.schema().to_string(),
                        query,
                    }
                }
            }
            EventData::RowsEvent(rows_event) => self.decode_rows_event(&rows_event)?,
            _ => SourceEvent::Other,
        };

        Ok(Some((
            BinlogPosition::new(self.current_file.clone(), log_pos),
            source_event,
        )))
    }

    fn decode_rows_event(&self, rows_event: &RowsEventData<'_>) -> CResult<SourceEvent> {
        let (table_id, kind, use_after_image) = match rows_event {
            RowsEventData::WriteRowsEvent(e) => (e.table_id(), EventKind::Insert, true),
            RowsEventData::WriteRowsEventV1(e) => (e.table_id(), EventKind::Insert, true),
            RowsEventData::UpdateRowsEvent(e) => (e.table_id(), EventKind::Insert, true),
            RowsEventData::UpdateRowsEventV1(e) => (e.table_id(), EventKind::Insert, true),
            RowsEventData::DeleteRowsEvent(e) => (e.table_id(), EventKind::Delete, false),
            RowsEventData::DeleteRowsEventV1(e) => (e.table_id(), EventKind::Delete, false),
            _ => return Ok(SourceEvent::Other),
        };

        let tme = self
            .stream
            .get_tme(table_id)
            .ok_or_else(|| {
                ReplError::TransientSource(format!("no table map event for table id {}", table_id))
            })?;

        let db_name = tme.database_name().to_string();
        let table_name = tme.table_name().to_string();

        let mut rows = Vec::new();
        for row in rows_iter(rows_event, tme) {
            let (before, after) = row.map_err(|err| ReplError::TransientSource(err.to_string()))?;
            let image = if use_after_image { after } else { before };
            if let Some(binlog_row) = image {
                rows.push(decode_row(&binlog_row)?);
            }
        }

        Ok(SourceEvent::Rows {
            db_name,
            table_name,
            kind,
            rows,
        })
    }
}

fn rows_iter<'a>(
    rows_event: &'a RowsEventData<'a>,
    tme: &'a TableMapEvent<'a>,
) -> mysql_common::binlog::events::RowsEventRows<'a> {
    match rows_event {
        RowsEventData::WriteRowsEvent(e) => e.rows(tme),
        RowsEventData::WriteRowsEventV1(e) => e.rows(tme),
        RowsEventData::UpdateRowsEvent(e) => e.rows(tme),
        RowsEventData::UpdateRowsEventV1(e) => e.rows(tme),
        RowsEventData::DeleteRowsEvent(e) => e.rows(tme),
        RowsEventData::DeleteRowsEventV1(e) => e.rows(tme),
        _ => unreachable!("filtered in decode_rows_event"),
    }
}

/// Decode a binlog row image into column values in declared column order.
fn decode_row(binlog_row: &BinlogRow) -> CResult<Vec<ColumnValue>> {
    let mut values = Vec::with_capacity(binlog_row.len());
    for idx in 0..binlog_row.len() {
        let value = match binlog_row.as_ref(idx) {
            Some(BinlogValue::Value(value)) => ColumnValue::from(value.clone()),
            Some(BinlogValue::Jsonb(jsonb)) => {
                let json: Result<serde_json::Value, _> = jsonb.clone().try_into();
                match json {
                    Ok(value) => ColumnValue::Json(value.to_string()),
                    Err(err) => {
                        return Err(ReplError::TransientSource(format!(
                            "undecodable json column: {:?}",
                            err
                        )))
                    }
                }
            }
            Some(BinlogValue::JsonDiff(_)) => {
                return Err(ReplError::TransientSource(
                    "partial json updates are not supported, \
                     set binlog_row_value_options='' on the source"
                        .to_string(),
                ))
            }
            None => ColumnValue::Null,
        };
        values.push(value);
    }
    Ok(values)
}
