use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::constants::ARCHIVE_CHAIN_SEPARATOR;

/// Protocols a host can be enumerated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ftp,
    Nfs,
    Smb,
    Local,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Nfs => "nfs",
            Protocol::Smb => "smb",
            Protocol::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Protocol> {
        match value {
            "ftp" => Some(Protocol::Ftp),
            "nfs" => Some(Protocol::Nfs),
            "smb" => Some(Protocol::Smb),
            "local" => Some(Protocol::Local),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol endpoint within a workspace. One host row is created per
/// enumeration root; its `completed` flag drives idempotent resume.
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub protocol: Protocol,
    pub address: String,
    pub port: Option<u16>,
    /// SMB share or NFS export, where the protocol has one.
    pub share: Option<String>,
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(share) = &self.share {
            write!(f, "/{}", share)?;
        }
        Ok(())
    }
}

/// Deferred byte retrieval so the size gate can decide before any transfer.
pub type ByteFetcher = Box<dyn FnOnce() -> Result<Vec<u8>> + Send>;

/// A file waiting on the work queue. Carries everything the analyzer needs
/// except the bytes themselves.
pub struct FileReference {
    pub host_id: i64,
    /// Path of the outermost file as observed on the host.
    pub full_path: String,
    /// Member chain for files found inside archives, outermost first.
    /// Empty for files observed directly.
    pub archive_chain: Vec<String>,
    pub size: u64,
    pub fetcher: ByteFetcher,
    pub access_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
}

impl FileReference {
    /// The path a reviewer sees: the host path plus any archive members,
    /// e.g. `backup/secrets.zip/id_rsa`.
    pub fn observable_path(&self) -> String {
        if self.archive_chain.is_empty() {
            return self.full_path.clone();
        }
        let mut path = self.full_path.clone();
        for member in &self.archive_chain {
            path.push(ARCHIVE_CHAIN_SEPARATOR);
            path.push_str(member);
        }
        path
    }

    /// Base name of the innermost file.
    pub fn file_name(&self) -> &str {
        let leaf = self
            .archive_chain
            .last()
            .map(String::as_str)
            .unwrap_or(self.full_path.as_str());
        leaf.rsplit(['/', '\\']).next().unwrap_or(leaf)
    }

    /// Lowercase extension without the leading dot, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Nesting depth: how many containers were opened to reach this file.
    pub fn depth(&self) -> usize {
        self.archive_chain.len()
    }
}

/// Counters shared between workers and printed as the run summary.
#[derive(Debug, Default)]
pub struct RunStats {
    pub files_inspected: AtomicU64,
    pub files_gated: AtomicU64,
    pub files_deduplicated: AtomicU64,
    pub files_failed: AtomicU64,
    pub archives_opened: AtomicU64,
    pub archives_skipped: AtomicU64,
    pub matches_low: AtomicU64,
    pub matches_medium: AtomicU64,
    pub matches_high: AtomicU64,
}

impl RunStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_matches(&self) -> u64 {
        self.matches_low.load(Ordering::Relaxed)
            + self.matches_medium.load(Ordering::Relaxed)
            + self.matches_high.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(full_path: &str, chain: &[&str]) -> FileReference {
        FileReference {
            host_id: 1,
            full_path: full_path.to_string(),
            archive_chain: chain.iter().map(|s| s.to_string()).collect(),
            size: 0,
            fetcher: Box::new(|| Ok(Vec::new())),
            access_time: None,
            modified_time: None,
            creation_time: None,
        }
    }

    #[test]
    fn observable_path_joins_archive_chain() {
        let r = reference("/srv/backup/secrets.zip", &["inner.tar", "id_rsa"]);
        assert_eq!(r.observable_path(), "/srv/backup/secrets.zip/inner.tar/id_rsa");
        assert_eq!(r.file_name(), "id_rsa");
        assert_eq!(r.depth(), 2);
    }

    #[test]
    fn file_name_handles_backslash_paths() {
        let r = reference("it\\share\\passwords.kdbx", &[]);
        assert_eq!(r.file_name(), "passwords.kdbx");
        assert_eq!(r.extension().as_deref(), Some("kdbx"));
    }

    #[test]
    fn extension_absent_for_dotfiles_and_plain_names() {
        assert_eq!(reference("/home/user/.bashrc", &[]).extension(), None);
        assert_eq!(reference("/home/user/README", &[]).extension(), None);
    }
}
