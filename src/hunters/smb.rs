use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use pavao::{SmbClient, SmbCredentials, SmbDirentType, SmbOpenOptions, SmbOptions};

use crate::config::HuntConfig;
use crate::constants::SMB_EMPTY_LM_HASH;
use crate::hunters::{FileSink, Hunter};
use crate::models::{ByteFetcher, FileReference, HostSpec, Protocol};

/// How the SMB session authenticates.
#[derive(Debug, Clone)]
pub enum SmbAuth {
    Password { username: String, password: String },
    /// Pass-the-hash: `LMHASH:NTHASH` or a bare NT hash.
    NtHash { username: String, hash: String },
    /// Null session.
    Anonymous,
}

impl SmbAuth {
    /// Validate and normalize the hash form to `LMHASH:NTHASH`.
    pub fn normalize(self) -> Result<SmbAuth> {
        match self {
            SmbAuth::NtHash { username, hash } => {
                let (lm, nt) = match hash.split_once(':') {
                    Some((lm, nt)) => (lm.to_string(), nt.to_string()),
                    None => (SMB_EMPTY_LM_HASH.to_string(), hash),
                };
                for (label, value) in [("LM", &lm), ("NT", &nt)] {
                    if value.len() != 32 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
                        bail!("invalid {} hash: {}", label, value);
                    }
                }
                Ok(SmbAuth::NtHash {
                    username,
                    hash: format!("{}:{}", lm.to_ascii_lowercase(), nt.to_ascii_lowercase()),
                })
            }
            other => Ok(other),
        }
    }
}

/// Walks the shares of an SMB endpoint. Shares can be restricted on the
/// command line; administrative shares ending in `$` are skipped unless
/// named explicitly.
pub struct SmbHunter {
    address: String,
    port: u16,
    domain: String,
    auth: SmbAuth,
    shares: Vec<String>,
    config: Arc<HuntConfig>,
    client: Option<SmbClient>,
}

impl SmbHunter {
    pub fn new(
        address: String,
        port: u16,
        domain: String,
        auth: SmbAuth,
        shares: Vec<String>,
        config: Arc<HuntConfig>,
    ) -> SmbHunter {
        SmbHunter {
            address,
            port,
            domain,
            auth,
            shares,
            config,
            client: None,
        }
    }

    fn server_url(&self) -> String {
        format!("smb://{}:{}", self.address, self.port)
    }

    fn credentials(&self) -> SmbCredentials {
        let mut credentials = SmbCredentials::default()
            .server(self.server_url())
            .workgroup(self.domain.clone());
        match &self.auth {
            SmbAuth::Password { username, password } => {
                credentials = credentials
                    .username(username.clone())
                    .password(password.clone());
            }
            // libsmbclient accepts the LM:NT hash string in the password
            // slot when hash logins are enabled on the client side
            SmbAuth::NtHash { username, hash } => {
                credentials = credentials.username(username.clone()).password(hash.clone());
            }
            SmbAuth::Anonymous => {}
        }
        credentials
    }

    fn explicit_shares(&self) -> bool {
        !self.shares.is_empty()
    }

    /// List the shares the server exposes, minus administrative ones.
    fn list_shares(client: &SmbClient) -> Result<Vec<String>> {
        let mut shares = Vec::new();
        for entry in client.list_dir("/").context("cannot list shares")? {
            if entry.get_type() == SmbDirentType::FileShare {
                let name = entry.name().to_string();
                if name.ends_with('$') {
                    debug!("skipping administrative share {}", name);
                    continue;
                }
                shares.push(name);
            }
        }
        Ok(shares)
    }

    fn enumerate_share(
        &self,
        client: &SmbClient,
        share: &str,
        sink: &FileSink,
        host_id: i64,
    ) -> Result<()> {
        let mut stack = vec![format!("/{}", share)];
        let mut visited = HashSet::new();
        while let Some(directory) = stack.pop() {
            if sink.cancelled() {
                return Ok(());
            }
            if !visited.insert(directory.clone()) {
                debug!("already visited {}, skipping (link cycle?)", directory);
                continue;
            }
            let entries = match client.list_dir(&directory) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("cannot access {}: {}", directory, err);
                    continue;
                }
            };
            for entry in entries {
                let name = entry.name().to_string();
                if name == "." || name == ".." {
                    continue;
                }
                let full_path = format!("{}/{}", directory.trim_end_matches('/'), name);
                match entry.get_type() {
                    SmbDirentType::Dir => stack.push(full_path),
                    SmbDirentType::File => {
                        let stat = match client.stat(&full_path) {
                            Ok(stat) => stat,
                            Err(err) => {
                                warn!("cannot stat {}: {}", full_path, err);
                                continue;
                            }
                        };
                        let size = stat.size;
                        let fetcher: ByteFetcher = if self.config.within_gate(&name, size) {
                            match read_file(client, &full_path) {
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
                            access_time: Some(stat.accessed.into()),
                            modified_time: Some(stat.modified.into()),
                            creation_time: Some(stat.created.into()),
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

fn read_file(client: &SmbClient, path: &str) -> Result<Vec<u8>> {
    let mut file = client
        .open_with(path, SmbOpenOptions::default().read(true))
        .context("open failed")?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).context("read failed")?;
    Ok(bytes)
}

impl Hunter for SmbHunter {
    fn host(&self) -> HostSpec {
        HostSpec {
            protocol: Protocol::Smb,
            address: self.address.clone(),
            port: Some(self.port),
            share: if self.explicit_shares() {
                Some(self.shares.join(","))
            } else {
                None
            },
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.auth = self.auth.clone().normalize()?;
        let client = SmbClient::new(
            self.credentials(),
            SmbOptions::default().one_share_per_server(true),
        )
        .context(format!("cannot connect to {}", self.server_url()))?;
        // Fail on bad credentials now, not mid-walk
        client
            .list_dir("/")
            .context("SMB session rejected (authentication?)")?;
        self.client = Some(client);
        Ok(())
    }

    fn enumerate(&mut self, sink: &FileSink, host_id: i64) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| anyhow!("enumerate called before connect"))?;
        let shares = if self.explicit_shares() {
            self.shares.clone()
        } else {
            Self::list_shares(&client)?
        };
        for share in &shares {
            if sink.cancelled() {
                break;
            }
            debug!("enumerating share {}/{}", self.address, share);
            if let Err(err) = self.enumerate_share(&client, share, sink, host_id) {
                warn!("cannot enumerate share {}: {:#}", share, err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_nt_hash_gains_the_empty_lm_half() {
        let auth = SmbAuth::NtHash {
            username: "svc".to_string(),
            hash: "31D6CFE0D16AE931B73C59D7E0C089C0".to_string(),
        }
        .normalize()
        .unwrap();
        match auth {
            SmbAuth::NtHash { hash, .. } => assert_eq!(
                hash,
                format!("{}:31d6cfe0d16ae931b73c59d7e0c089c0", SMB_EMPTY_LM_HASH)
            ),
            _ => panic!("expected hash auth"),
        }
    }

    #[test]
    fn malformed_hash_is_rejected() {
        for bad in ["zz", "31D6CFE0D16AE931B73C59D7E0C089", "xyz:abc"] {
            let result = SmbAuth::NtHash {
                username: "svc".to_string(),
                hash: bad.to_string(),
            }
            .normalize();
            assert!(result.is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn password_and_anonymous_pass_through() {
        assert!(matches!(
            SmbAuth::Anonymous.normalize().unwrap(),
            SmbAuth::Anonymous
        ));
        let auth = SmbAuth::Password {
            username: "u".to_string(),
            password: "p".to_string(),
        }
        .normalize()
        .unwrap();
        assert!(matches!(auth, SmbAuth::Password { .. }));
    }
}
