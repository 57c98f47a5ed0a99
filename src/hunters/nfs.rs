use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use libnfs::{EntryType, Mode, Nfs};
use log::{debug, warn};

use crate::config::HuntConfig;
use crate::hunters::{FileSink, Hunter};
use crate::models::{ByteFetcher, FileReference, HostSpec, Protocol};

/// Walks an NFS export mounted through libnfs. User and group ids in the
/// listing are informational only.
pub struct NfsHunter {
    address: String,
    port: u16,
    export: String,
    config: Arc<HuntConfig>,
    client: Option<Nfs>,
}

impl NfsHunter {
    pub fn new(address: String, port: u16, export: String, config: Arc<HuntConfig>) -> NfsHunter {
        NfsHunter {
            address,
            port,
            export,
            config,
            client: None,
        }
    }
}

fn to_utc(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

impl Hunter for NfsHunter {
    fn host(&self) -> HostSpec {
        HostSpec {
            protocol: Protocol::Nfs,
            address: self.address.clone(),
            port: Some(self.port),
            share: Some(self.export.clone()),
        }
    }

    fn connect(&mut self) -> Result<()> {
        let nfs = Nfs::new().context("cannot initialize NFS context")?;
        nfs.mount(&self.address, &self.export).context(format!(
            "cannot mount nfs://{}{}",
            self.address, self.export
        ))?;
        self.client = Some(nfs);
        Ok(())
    }

    fn enumerate(&mut self, sink: &FileSink, host_id: i64) -> Result<()> {
        let nfs = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow!("enumerate called before connect"))?;
        let mut stack = vec!["/".to_string()];
        // Inode set guards against loops through symlinked directories
        let mut visited: HashSet<u64> = HashSet::new();
        while let Some(directory) = stack.pop() {
            if sink.cancelled() {
                return Ok(());
            }
            let entries = match nfs.opendir(Path::new(&directory)) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("cannot access {}: {}", directory, err);
                    continue;
                }
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("cannot read entry in {}: {}", directory, err);
                        continue;
                    }
                };
                let name = entry.path.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    continue;
                }
                let full_path = if directory.ends_with('/') {
                    format!("{}{}", directory, name)
                } else {
                    format!("{}/{}", directory, name)
                };
                match entry.d_type {
                    EntryType::Directory => {
                        if visited.insert(entry.inode) {
                            stack.push(full_path);
                        } else {
                            debug!("already visited {}, skipping (link cycle?)", full_path);
                        }
                    }
                    EntryType::File => {
                        let size = entry.size as u64;
                        let fetcher: ByteFetcher = if self.config.within_gate(&name, size) {
                            match read_file(nfs, &full_path, size) {
                                Ok(bytes) => Box::new(move || Ok(bytes)),
                                Err(err) => {
                                    warn!("cannot read file {}: {:#}", full_path, err);
                                    continue;
                                }
                            }
                        } else {
                            Box::new(|| Err(anyhow!("file exceeds the size gate")))
                        };
                        let reference = FileReference {
                            host_id,
                            full_path,
                            archive_chain: Vec::new(),
                            size,
                            fetcher,
                            access_time: to_utc(entry.atime.tv_sec as i64),
                            modified_time: to_utc(entry.mtime.tv_sec as i64),
                            creation_time: to_utc(entry.ctime.tv_sec as i64),
                        };
                        if !sink.submit(reference) {
                            return Ok(());
                        }
                    }
                    _ => debug!("skipping special entry: {}", full_path),
                }
            }
        }
        Ok(())
    }
}

fn read_file(nfs: &mut Nfs, path: &str, size: u64) -> Result<Vec<u8>> {
    let mut file = nfs
        .open(Path::new(path), Mode::O_RDONLY)
        .context("open failed")?;
    let bytes = file.pread(size, 0).context("read failed")?;
    Ok(bytes)
}
