use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Map the configured log level name to a tracing level.
/// `critical` has no direct tracing counterpart and maps to ERROR.
pub fn parse_level(level: &str) -> Option<Level> {
    match level {
        "critical" | "error" => Some(Level::ERROR),
        "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        _ => None,
    }
}

/// Initialize the global tracing subscriber. `tag` identifies the process in
/// every line (`binlogrepl`, `dbrepl <db>`, ...). Safe to call more than
/// once, later calls are no-ops.
pub fn init_log(tag: &str, level: &str) {
    let level = parse_level(level).unwrap_or(Level::INFO);

    let format = tracing_subscriber::fmt::format()
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .event_format(format)
        .with_writer(std::io::stderr.with_max_level(level))
        .try_init();

    tracing::info!("[{}] logging initialized, level {}", tag, level);
}
