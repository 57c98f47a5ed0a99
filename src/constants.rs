//! Global constants for the filehound application.
//!
//! This module centralizes all hardcoded values to improve maintainability
//! and make configuration changes easier.

// Size thresholds
/// Default maximum size of a regular file that is fetched whole (50MB)
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// Default maximum size of an archive container that is fetched whole (100MB)
pub const DEFAULT_MAX_ARCHIVE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Default maximum archive nesting depth before members are skipped
pub const DEFAULT_MAX_ARCHIVE_DEPTH: usize = 8;

// Worker pool and queue
/// Work queue depth is this factor times the worker pool size
pub const QUEUE_DEPTH_FACTOR: usize = 4;

/// Seconds the coordinator waits for in-flight analyses on shutdown
pub const DRAIN_DEADLINE_SECS: u64 = 30;

/// Poll interval for worker loops waiting on quiet queues
pub const WORKER_POLL_INTERVAL_MS: u64 = 100;

// Retry behaviour for transient database and network errors
/// Maximum retry attempts
pub const MAX_RETRIES: usize = 3;

/// Base retry delay in milliseconds
pub const RETRY_BASE_DELAY_MS: u64 = 250;

/// Maximum retry delay in seconds
pub const RETRY_MAX_DELAY_SECS: u64 = 30;

// Rule priority constants. Higher priority rules are evaluated first.
// The location summands keep content rules above path rules above name
// rules at equal relevance and accuracy.
/// Location summand for file-name rules
pub const PRIORITY_LOCATION_FILE_NAME: i64 = 1;

/// Location summand for full-path rules
pub const PRIORITY_LOCATION_FULL_PATH: i64 = 10_000;

/// Location summand for file-content rules
pub const PRIORITY_LOCATION_FILE_CONTENT: i64 = 100_000;

/// Relevance rank multiplier
pub const PRIORITY_RELEVANCE_FACTOR: i64 = 2_000;

/// Accuracy rank multiplier
pub const PRIORITY_ACCURACY_FACTOR: i64 = 200;

// Magic byte signatures used for archive sniffing and type hints
/// ZIP local file header signature ("PK\x03\x04")
pub const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// GZIP member header signature
pub const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Offset of the "ustar" marker inside a tar header block
pub const TAR_MAGIC_OFFSET: usize = 257;

/// The "ustar" marker itself
pub const TAR_MAGIC: &[u8] = b"ustar";

// Protocol defaults
/// Default FTP control port
pub const FTP_DEFAULT_PORT: u16 = 21;

/// Default NFS port
pub const NFS_DEFAULT_PORT: u16 = 2049;

/// Default SMB port
pub const SMB_DEFAULT_PORT: u16 = 445;

/// Empty LM hash used when only an NT hash is supplied for SMB logins
pub const SMB_EMPTY_LM_HASH: &str = "aad3b435b51404eeaad3b435b51404ee";

/// Separator used when an observed path includes an archive member chain
pub const ARCHIVE_CHAIN_SEPARATOR: char = '/';

/// Default database file when no --db argument is given
pub const DEFAULT_DATABASE_FILE: &str = "filehound.db";

// Process exit codes
pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_DATABASE: i32 = 3;
pub const EXIT_NO_DRIVER: i32 = 4;
pub const EXIT_CANCELLED: i32 = 130;
