mod settings;

pub use settings::{
    BinlogReplicatorSettings, ClickhouseSettings, IndexRule, MysqlSettings, PartitionByRule,
    Settings,
};
