use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::constants::{DEFAULT_DATABASE_FILE, FTP_DEFAULT_PORT, NFS_DEFAULT_PORT, SMB_DEFAULT_PORT};

#[derive(Parser, Debug)]
#[clap(
    name = "filehound",
    about = "Hunts file shares (FTP, NFS, SMB, local trees) for sensitive files",
    version
)]
pub struct Args {
    /// Verbose logging
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Log messages to the given file in addition to the terminal
    #[clap(long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Path to the hunt configuration YAML file
    #[clap(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file holding workspaces and findings
    #[clap(long, global = true, default_value = DEFAULT_DATABASE_FILE)]
    pub db: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the database and its workspaces
    Db(DbOpts),

    /// Hunt one or more local directory trees
    Local(LocalOpts),

    /// Hunt an FTP service (the server must support MLSD)
    Ftp(FtpOpts),

    /// Hunt an NFS export
    Nfs(NfsOpts),

    /// Hunt SMB shares
    Smb(SmbOpts),

    /// Review collected findings (handled by the companion console)
    Review {
        /// The workspace used for the enumeration
        #[clap(short, long)]
        workspace: String,
    },

    /// Generate reports (handled by the companion report generator)
    Report {
        /// The workspace used for the enumeration
        #[clap(short, long)]
        workspace: String,
    },
}

#[derive(ClapArgs, Debug)]
pub struct DbOpts {
    /// Create all tables
    #[clap(long)]
    pub init: bool,

    /// Drop all tables and their contents
    #[clap(long)]
    pub drop: bool,

    /// Create the given workspace
    #[clap(short = 'a', long = "add", value_name = "WORKSPACE")]
    pub add: Option<String>,

    /// List existing workspaces
    #[clap(short, long)]
    pub list: bool,
}

/// Arguments shared by every collection subcommand.
#[derive(ClapArgs, Debug)]
pub struct CollectOpts {
    /// The workspace used for the enumeration
    #[clap(short, long)]
    pub workspace: String,

    /// Number of analysis worker threads (default: CPU count)
    #[clap(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Enumerate the host again even if a previous run completed it
    #[clap(long)]
    pub reanalyze: bool,
}

#[derive(ClapArgs, Debug)]
pub struct LocalOpts {
    #[clap(flatten)]
    pub collect: CollectOpts,

    /// Directory trees to hunt
    #[clap(required = true)]
    pub path: Vec<PathBuf>,

    /// Follow mount points into other filesystems
    #[clap(long)]
    pub cross_filesystems: bool,
}

#[derive(ClapArgs, Debug)]
pub struct FtpOpts {
    #[clap(flatten)]
    pub collect: CollectOpts,

    /// The target FTP service's address
    #[clap(long)]
    pub host: String,

    /// The target FTP service's port
    #[clap(long, default_value_t = FTP_DEFAULT_PORT)]
    pub port: u16,

    /// The name of the user to use for authentication
    #[clap(short, long, default_value = "anonymous")]
    pub username: String,

    /// Password of the given user
    #[clap(short, long, default_value = "")]
    pub password: String,

    /// Use FTPS (explicit TLS)
    #[clap(long)]
    pub tls: bool,
}

#[derive(ClapArgs, Debug)]
pub struct NfsOpts {
    #[clap(flatten)]
    pub collect: CollectOpts,

    /// The target NFS service's address
    #[clap(long)]
    pub host: String,

    /// The target NFS service's port
    #[clap(long, default_value_t = NFS_DEFAULT_PORT)]
    pub port: u16,

    /// The export to mount and enumerate
    #[clap(long, value_name = "PATH")]
    pub export: String,
}

#[derive(ClapArgs, Debug)]
pub struct SmbOpts {
    #[clap(flatten)]
    pub collect: CollectOpts,

    /// The target SMB service's address
    #[clap(long)]
    pub host: String,

    /// The target SMB service's port
    #[clap(long, default_value_t = SMB_DEFAULT_PORT)]
    pub port: u16,

    /// The name of the user to use for authentication
    #[clap(short, long)]
    pub username: Option<String>,

    /// Password of the given user
    #[clap(short, long, conflicts_with = "hash", requires = "username")]
    pub password: Option<String>,

    /// NTLM hashes, as LMHASH:NTHASH or a bare NT hash
    #[clap(long, value_name = "LMHASH:NTHASH", conflicts_with = "password", requires = "username")]
    pub hash: Option<String>,

    /// The domain to use for authentication
    #[clap(short, long, default_value = ".")]
    pub domain: String,

    /// Shares to enumerate; all non-administrative shares when omitted
    #[clap(long, num_args = 0.., value_name = "SHARE")]
    pub shares: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn local_requires_a_path() {
        assert!(Args::try_parse_from(["filehound", "local", "-w", "ws"]).is_err());
        let args =
            Args::try_parse_from(["filehound", "local", "-w", "ws", "/srv/data"]).unwrap();
        match args.command {
            Commands::Local(opts) => {
                assert_eq!(opts.collect.workspace, "ws");
                assert_eq!(opts.path, vec![PathBuf::from("/srv/data")]);
            }
            _ => panic!("expected local subcommand"),
        }
    }

    #[test]
    fn smb_password_and_hash_are_mutually_exclusive() {
        assert!(Args::try_parse_from([
            "filehound", "smb", "-w", "ws", "--host", "10.0.0.1", "-u", "svc", "-p", "x",
            "--hash", "abc",
        ])
        .is_err());
    }

    #[test]
    fn smb_hash_requires_a_username() {
        assert!(Args::try_parse_from([
            "filehound", "smb", "-w", "ws", "--host", "10.0.0.1", "--hash", "abc",
        ])
        .is_err());
    }
}
