use thiserror::Error;

/// Errors with meaning beyond "log and continue".
///
/// Configuration errors abort startup, protocol refusals abort the affected
/// driver, archive errors skip the container, and `DatabaseLost` is the only
/// error a worker raises to the coordinator.
#[derive(Debug, Error)]
pub enum HuntError {
    #[error("malformed match rule: {0}")]
    MalformedRule(String),

    #[error("bad threshold: {0}")]
    BadThreshold(String),

    #[error("FTP server does not advertise MLSD support")]
    FtpUnsupported,

    #[error("archive nesting exceeds the configured depth of {0}")]
    ArchiveTooDeep(usize),

    #[error("corrupt or unreadable archive: {0}")]
    ArchiveCorrupt(String),

    #[error("database unavailable: {0}")]
    DatabaseLost(String),
}
