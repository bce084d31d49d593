use small_je::{
    tx_log::{LogEntry, LogEntryHeader, LogEntryType, LogReader, Lsn},
    Environment,
};

/// Every entry of the log, oldest first.
pub fn log_entries(env: &Environment) -> Vec<(Lsn, LogEntryHeader, LogEntry)> {
    let log = env.log_manager();
    LogReader::new(log, log.first_lsn())
        .map(|item| item.unwrap())
        .collect()
}

pub fn count_entries(env: &Environment, entry_type: LogEntryType) -> usize {
    log_entries(env)
        .iter()
        .filter(|(_, header, _)| header.entry_type == entry_type)
        .count()
}

pub fn print_features() {
    if cfg!(feature = "read_uncommitted") {
        log::debug!("isolation feature: read_uncommitted");
    } else if cfg!(feature = "repeatable_read") || cfg!(feature = "serializable") {
        log::debug!("isolation feature: repeatable_read");
    } else {
        log::debug!("isolation feature: read_committed");
    }
}
