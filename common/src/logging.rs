use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Prints `<millis>: [node] LEVEL - message` lines to stdout.
pub struct NodeLogger {
    node: String,
    level: LevelFilter,
}

impl NodeLogger {
    pub fn new(node: &str, level: LevelFilter) -> Self {
        NodeLogger {
            node: node.to_string(),
            level,
        }
    }

    fn format(&self, millis: u128, record: &Record) -> String {
        format!(
            "{}:\t[{}] {} - {}",
            millis,
            self.node,
            record.level(),
            record.args()
        )
    }
}

impl log::Log for NodeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            println!("{}", self.format(millis, record));
        }
    }

    fn flush(&self) {}
}

/// Installs a `NodeLogger` as the global logger. Fails if one is already set.
pub fn init(node: &str, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(NodeLogger::new(node, level)))?;
    log::set_max_level(level);
    Ok(())
}
