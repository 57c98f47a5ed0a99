use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use suppaftp::native_tls::TlsConnector;
use suppaftp::{Mode, NativeTlsConnector, NativeTlsFtpStream};

use crate::config::HuntConfig;
use crate::error::HuntError;
use crate::hunters::{FileSink, Hunter};
use crate::models::{ByteFetcher, FileReference, HostSpec, Protocol};

/// Walks an FTP service. Directory listings use the MLSD extension; a
/// server that does not offer it fails the driver immediately.
pub struct FtpHunter {
    address: String,
    port: u16,
    username: String,
    password: String,
    tls: bool,
    config: Arc<HuntConfig>,
    client: Option<NativeTlsFtpStream>,
}

impl FtpHunter {
    pub fn new(
        address: String,
        port: u16,
        username: String,
        password: String,
        tls: bool,
        config: Arc<HuntConfig>,
    ) -> FtpHunter {
        FtpHunter {
            address,
            port,
            username,
            password,
            tls,
            config,
            client: None,
        }
    }
}

/// One entry of an MLSD listing: the machine-readable facts plus the name.
#[derive(Debug, PartialEq, Eq)]
struct MlsdEntry {
    name: String,
    kind: MlsdKind,
    size: u64,
    modify: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Eq)]
enum MlsdKind {
    File,
    Directory,
    Other,
}

/// Parse one `fact=value;fact=value; name` line as produced by MLSD.
/// Lines without a name part are ignored.
fn parse_mlsd_line(line: &str) -> Option<MlsdEntry> {
    let (facts, name) = line.split_once(' ')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut kind = MlsdKind::Other;
    let mut size = 0u64;
    let mut modify = None;
    for fact in facts.split(';') {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                kind = match value.to_ascii_lowercase().as_str() {
                    "file" => MlsdKind::File,
                    "dir" => MlsdKind::Directory,
                    _ => MlsdKind::Other,
                };
            }
            "size" => size = value.parse().unwrap_or(0),
            "modify" => {
                modify = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
                    .ok()
                    .map(|t| t.and_utc());
            }
            _ => {}
        }
    }
    Some(MlsdEntry {
        name: name.to_string(),
        kind,
        size,
        modify,
    })
}

fn join_ftp_path(directory: &str, name: &str) -> String {
    if directory.ends_with('/') {
        format!("{}{}", directory, name)
    } else {
        format!("{}/{}", directory, name)
    }
}

impl Hunter for FtpHunter {
    fn host(&self) -> HostSpec {
        HostSpec {
            protocol: Protocol::Ftp,
            address: self.address.clone(),
            port: Some(self.port),
            share: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.address, self.port);
        let mut client = NativeTlsFtpStream::connect(addr.as_str())
            .context(format!("cannot connect to ftp://{}", addr))?;
        if self.tls {
            let connector = TlsConnector::new().context("cannot build TLS connector")?;
            client = client
                .into_secure(NativeTlsConnector::from(connector), &self.address)
                .context("TLS negotiation failed")?;
        }
        client
            .login(&self.username, &self.password)
            .context("FTP login failed")?;
        client.set_mode(Mode::Passive);
        self.client = Some(client);
        Ok(())
    }

    fn enumerate(&mut self, sink: &FileSink, host_id: i64) -> Result<()> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow!("enumerate called before connect"))?;
        let root = client.pwd().context("cannot determine working directory")?;
        let mut stack = vec![root];
        let mut visited = HashSet::new();
        let mut first_listing = true;
        while let Some(directory) = stack.pop() {
            if sink.cancelled() {
                return Ok(());
            }
            if !visited.insert(directory.clone()) {
                debug!("already visited {}, skipping (link cycle?)", directory);
                continue;
            }
            let lines = match client.mlsd(Some(directory.as_str())) {
                Ok(lines) => lines,
                Err(err) if first_listing => {
                    // No MLSD on the very first listing: the extension is
                    // missing, not the directory
                    debug!("initial MLSD failed: {}", err);
                    return Err(HuntError::FtpUnsupported.into());
                }
                Err(err) => {
                    warn!("cannot list {}: {}", directory, err);
                    continue;
                }
            };
            first_listing = false;
            for line in &lines {
                let Some(entry) = parse_mlsd_line(line) else {
                    continue;
                };
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                let full_path = join_ftp_path(&directory, &entry.name);
                match entry.kind {
                    MlsdKind::Directory => stack.push(full_path),
                    MlsdKind::Other => debug!("skipping special entry: {}", full_path),
                    MlsdKind::File => {
                        let fetcher: ByteFetcher =
                            if self.config.within_gate(&entry.name, entry.size) {
                                match client.retr_as_buffer(&full_path) {
                                    Ok(buffer) => {
                                        let bytes = buffer.into_inner();
                                        Box::new(move || Ok(bytes))
                                    }
                                    Err(err) => {
                                        warn!("cannot read file {}: {}", full_path, err);
                                        continue;
                                    }
                                }
                            } else {
                                // Refused without opening a data connection
                                Box::new(|| Err(anyhow!("file exceeds the size gate")))
                            };
                        let reference = FileReference {
                            host_id,
                            full_path,
                            archive_chain: Vec::new(),
                            size: entry.size,
                            fetcher,
                            access_time: None,
                            modified_time: entry.modify,
                            creation_time: None,
                        };
                        if !sink.submit(reference) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_facts() {
        let entry =
            parse_mlsd_line("type=file;size=1034;modify=20230801120000; settings.ini").unwrap();
        assert_eq!(entry.name, "settings.ini");
        assert_eq!(entry.kind, MlsdKind::File);
        assert_eq!(entry.size, 1034);
        assert_eq!(
            entry.modify.unwrap().to_rfc3339(),
            "2023-08-01T12:00:00+00:00"
        );
    }

    #[test]
    fn parses_directory_and_special_entries() {
        let dir = parse_mlsd_line("type=dir;modify=20230801120000; uploads").unwrap();
        assert_eq!(dir.kind, MlsdKind::Directory);
        let cdir = parse_mlsd_line("type=cdir; .").unwrap();
        assert_eq!(cdir.kind, MlsdKind::Other);
    }

    #[test]
    fn tolerates_missing_and_unknown_facts() {
        let entry = parse_mlsd_line("type=file;unique=8U1;perm=r; data.bin").unwrap();
        assert_eq!(entry.size, 0);
        assert!(entry.modify.is_none());
        assert!(parse_mlsd_line("no-facts-or-name").is_none());
    }

    #[test]
    fn name_may_contain_spaces() {
        let entry = parse_mlsd_line("type=file;size=5; annual report.xlsx").unwrap();
        assert_eq!(entry.name, "annual report.xlsx");
    }

    #[test]
    fn path_join_avoids_double_slash() {
        assert_eq!(join_ftp_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_ftp_path("/pub", "a.txt"), "/pub/a.txt");
    }
}
