use backtrace::Backtrace;
use log::error;
use thiserror::Error;

/// Every error an environment operation can report.
///
/// Two groups matter to callers:
///
/// - contention errors (`LockTimeout`, `Deadlock`): the transaction
///   owner decides whether to retry or abort.
/// - fatal errors (`LogIo`, `LogFormat`, `Recovery`,
///   `EnvironmentInvalid`): the environment is dead and has to be
///   reopened, which runs recovery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SmallError {
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("locker {locker} is owned by another thread")]
    LockerWrongThread { locker: u64 },

    #[error("log io error: {0}")]
    LogIo(String),

    #[error("log format error: {0}")]
    LogFormat(String),

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("environment is invalid, reopen it to run recovery: {0}")]
    EnvironmentInvalid(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("transaction {0} is not active")]
    TxnNotActive(u64),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl SmallError {
    pub fn new(msg: &str) -> SmallError {
        SmallError::Internal(msg.to_string())
    }

    pub fn log_io(action: &str, e: std::io::Error) -> SmallError {
        SmallError::LogIo(format!("{}: {}", action, e))
    }

    /// Errors after which the environment can't be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmallError::LogIo(_)
                | SmallError::LogFormat(_)
                | SmallError::Recovery(_)
                | SmallError::EnvironmentInvalid(_)
        )
    }

    /// Errors caused by lock contention, the caller may retry.
    pub fn is_contention(&self) -> bool {
        matches!(self, SmallError::LockTimeout(_) | SmallError::Deadlock(_))
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        error!("{}\nbacktrace:\n{:?}", self, bt);
    }
}
