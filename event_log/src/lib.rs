//! Per-database append-only event log.
//!
//! The binlog reader writes matched replication events here; one realtime
//! applier per database tails its directory. Layout:
//! `<data_dir>/<db_name>/<N>.bin`, N increasing from 1, each file a sequence
//! of `[u32 big-endian length][bincode payload]` records.

pub mod reader;
pub mod segment;
pub mod state;
pub mod writer;
