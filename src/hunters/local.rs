use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use walkdir::WalkDir;

use crate::hunters::{FileSink, Hunter};
use crate::models::{ByteFetcher, FileReference, HostSpec, Protocol};

/// Walks one or more local directory trees. Symlinks are followed with
/// walkdir's ancestor-based loop detection; special files are skipped.
pub struct LocalHunter {
    roots: Vec<PathBuf>,
    one_file_system: bool,
}

impl LocalHunter {
    pub fn new(roots: Vec<PathBuf>, one_file_system: bool) -> LocalHunter {
        LocalHunter {
            roots,
            one_file_system,
        }
    }
}

impl Hunter for LocalHunter {
    fn host(&self) -> HostSpec {
        HostSpec {
            protocol: Protocol::Local,
            address: "127.0.0.1".to_string(),
            port: None,
            share: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        for root in &self.roots {
            let metadata = fs::metadata(root)
                .context(format!("cannot access root {}", root.display()))?;
            if !metadata.is_dir() {
                anyhow::bail!("root {} is not a directory", root.display());
            }
        }
        Ok(())
    }

    fn enumerate(&mut self, sink: &FileSink, host_id: i64) -> Result<()> {
        for root in &self.roots {
            let walker = WalkDir::new(root)
                .follow_links(true)
                .same_file_system(self.one_file_system);
            for entry in walker {
                if sink.cancelled() {
                    return Ok(());
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        // Loop detection and permission problems land here
                        warn!("cannot read directory entry: {}", err);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    debug!("skipping non-regular file: {}", entry.path().display());
                    continue;
                }
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!("cannot stat {}: {}", entry.path().display(), err);
                        continue;
                    }
                };
                let full_path = entry.path().to_string_lossy().into_owned();
                let fetch_path = entry.path().to_path_buf();
                // The analyzer's size gate decides whether this ever runs
                let fetcher: ByteFetcher = Box::new(move || {
                    fs::read(&fetch_path)
                        .context(format!("cannot read file {}", fetch_path.display()))
                });
                let reference = FileReference {
                    host_id,
                    full_path,
                    archive_chain: Vec::new(),
                    size: metadata.len(),
                    fetcher,
                    access_time: metadata.accessed().ok().map(to_utc),
                    modified_time: metadata.modified().ok().map(to_utc),
                    creation_time: metadata.created().ok().map(to_utc),
                };
                if !sink.submit(reference) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sink() -> (FileSink, crossbeam::channel::Receiver<FileReference>) {
        let (tx, rx) = unbounded();
        (
            FileSink::new(
                tx,
                Arc::new(AtomicUsize::new(0)),
                Arc::new(AtomicBool::new(false)),
            ),
            rx,
        )
    }

    #[test]
    fn walks_nested_directories_and_skips_directories_themselves() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/top.txt"), b"1").unwrap();
        fs::write(dir.path().join("a/b/deep.txt"), b"22").unwrap();

        let mut hunter = LocalHunter::new(vec![dir.path().to_path_buf()], true);
        hunter.connect().unwrap();
        let (sink, rx) = sink();
        hunter.enumerate(&sink, 1).unwrap();

        let mut names: Vec<String> = rx
            .try_iter()
            .map(|r| r.file_name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["deep.txt", "top.txt"]);
    }

    #[test]
    fn fetcher_reads_the_file_lazily() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.txt"), b"password=hunter2\n").unwrap();
        let mut hunter = LocalHunter::new(vec![dir.path().to_path_buf()], true);
        let (sink, rx) = sink();
        hunter.enumerate(&sink, 1).unwrap();
        let reference = rx.try_recv().unwrap();
        assert_eq!(reference.size, 17);
        assert_eq!((reference.fetcher)().unwrap(), b"password=hunter2\n");
    }

    #[test]
    fn connect_rejects_missing_root() {
        let mut hunter = LocalHunter::new(vec![PathBuf::from("/definitely/not/here")], true);
        assert!(hunter.connect().is_err());
    }
}
