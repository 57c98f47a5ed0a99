use std::fs::File;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use filehound::cli::{Args, Commands, DbOpts, FtpOpts, LocalOpts, NfsOpts, SmbOpts};
use filehound::config::{load_or_create_config, HuntConfig};
use filehound::constants::{
    EXIT_CANCELLED, EXIT_DATABASE, EXIT_NO_DRIVER, EXIT_OK, EXIT_USAGE,
};
use filehound::coordinator::{run_collection, CollectionOptions, CollectionOutcome};
use filehound::hunters::ftp::FtpHunter;
use filehound::hunters::local::LocalHunter;
use filehound::hunters::nfs::NfsHunter;
use filehound::hunters::smb::{SmbAuth, SmbHunter};
use filehound::hunters::Hunter;
use filehound::models::RunStats;
use filehound::store::Store;

fn main() {
    let args = Args::parse();

    if let Err(err) = initialize_logging(&args) {
        eprintln!("cannot initialize logging: {:#}", err);
        process::exit(EXIT_USAGE);
    }

    process::exit(run(args));
}

/// Initialize logging with the requested verbosity and optional log file
fn initialize_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &args.log {
        let file = File::create(path)
            .context(format!("cannot create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, Config::default(), file));
    }
    CombinedLogger::init(loggers).context("logger already initialized")?;
    Ok(())
}

fn run(args: Args) -> i32 {
    let store = match Store::open(&args.db) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("{:#}", err);
            return EXIT_DATABASE;
        }
    };

    let result = match args.command {
        Commands::Db(ref opts) => handle_db(&store, opts),
        Commands::Review { ref workspace } => handle_handoff(&store, workspace, "review"),
        Commands::Report { ref workspace } => handle_handoff(&store, workspace, "report"),
        Commands::Local(_) | Commands::Ftp(_) | Commands::Nfs(_) | Commands::Smb(_) => {
            return handle_collection(&store, args);
        }
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            EXIT_DATABASE
        }
    }
}

fn handle_db(store: &Arc<Store>, opts: &DbOpts) -> Result<i32> {
    if opts.drop {
        store.drop_schema()?;
        info!("dropped all tables");
    }
    if opts.init {
        store.init_schema()?;
        info!("database initialized");
    }
    if let Some(workspace) = &opts.add {
        store.init_schema()?;
        store.add_workspace(workspace)?;
        info!("workspace '{}' created", workspace);
    }
    if opts.list {
        let workspaces = store.list_workspaces()?;
        if workspaces.is_empty() {
            println!("database does not contain any workspaces");
        } else {
            println!("the following workspaces exist:");
            for workspace in workspaces {
                println!("- {}", workspace);
            }
        }
    }
    Ok(EXIT_OK)
}

/// The review console and the report generator live outside this binary;
/// point the operator at the data they consume.
fn handle_handoff(store: &Arc<Store>, workspace: &str, tool: &str) -> Result<i32> {
    match store.workspace_id(workspace)? {
        Some(_) => {
            println!(
                "workspace '{}' is ready; run the companion {} tool against the database file",
                workspace, tool
            );
            Ok(EXIT_OK)
        }
        None => {
            error!("workspace '{}' does not exist in the database", workspace);
            Ok(EXIT_USAGE)
        }
    }
}

fn handle_collection(store: &Arc<Store>, args: Args) -> i32 {
    let config = match load_or_create_config(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!("configuration error: {:#}", err);
            return EXIT_USAGE;
        }
    };
    let rules = match config.compile_rules() {
        Ok(rules) => Arc::new(rules),
        Err(err) => {
            error!("configuration error: {:#}", err);
            return EXIT_USAGE;
        }
    };
    if rules.is_empty() {
        warn!("the rule set is empty, nothing can match");
    }

    let (workspace, threads, reanalyze, hunter) = match build_hunter(args.command, &config) {
        Ok(parts) => parts,
        Err(err) => {
            error!("{:#}", err);
            return EXIT_USAGE;
        }
    };

    if let Err(err) = store.init_schema() {
        error!("{:#}", err);
        return EXIT_DATABASE;
    }
    let workspace_id = match store.add_workspace(&workspace) {
        Ok(id) => id,
        Err(err) => {
            error!("{:#}", err);
            return EXIT_DATABASE;
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        let interrupted = Arc::clone(&interrupted);
        if let Err(err) = ctrlc::set_handler(move || {
            warn!("cancellation requested, draining in-flight analyses");
            interrupted.store(true, Ordering::Relaxed);
            cancel.store(true, Ordering::Relaxed);
        }) {
            warn!("cannot install the cancellation handler: {}", err);
        }
    }

    info!("starting collection into workspace '{}'", workspace);
    let options = CollectionOptions {
        workers: threads.unwrap_or_else(num_cpus::get),
        reanalyze,
        ..CollectionOptions::default()
    };
    let outcome = match run_collection(
        Arc::clone(store),
        config,
        rules,
        workspace_id,
        vec![hunter],
        options,
        Arc::clone(&cancel),
    ) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("{:#}", err);
            return EXIT_DATABASE;
        }
    };

    print_summary(store, workspace_id, &outcome);

    if interrupted.load(Ordering::Relaxed) {
        EXIT_CANCELLED
    } else if outcome.hosts_started == 0 && outcome.hosts_failed > 0 {
        EXIT_NO_DRIVER
    } else {
        EXIT_OK
    }
}

type HunterParts = (String, Option<usize>, bool, Box<dyn Hunter>);

fn build_hunter(command: Commands, config: &Arc<HuntConfig>) -> Result<HunterParts> {
    match command {
        Commands::Local(LocalOpts {
            collect,
            path,
            cross_filesystems,
        }) => Ok((
            collect.workspace,
            collect.threads,
            collect.reanalyze,
            Box::new(LocalHunter::new(path, !cross_filesystems)),
        )),
        Commands::Ftp(FtpOpts {
            collect,
            host,
            port,
            username,
            password,
            tls,
        }) => Ok((
            collect.workspace,
            collect.threads,
            collect.reanalyze,
            Box::new(FtpHunter::new(
                host,
                port,
                username,
                password,
                tls,
                Arc::clone(config),
            )),
        )),
        Commands::Nfs(NfsOpts {
            collect,
            host,
            port,
            export,
        }) => Ok((
            collect.workspace,
            collect.threads,
            collect.reanalyze,
            Box::new(NfsHunter::new(host, port, export, Arc::clone(config))),
        )),
        Commands::Smb(SmbOpts {
            collect,
            host,
            port,
            username,
            password,
            hash,
            domain,
            shares,
        }) => {
            let auth = match (username, password, hash) {
                (Some(username), Some(password), None) => {
                    SmbAuth::Password { username, password }
                }
                (Some(username), None, Some(hash)) => SmbAuth::NtHash { username, hash },
                (Some(username), None, None) => SmbAuth::Password {
                    username,
                    password: String::new(),
                },
                _ => SmbAuth::Anonymous,
            };
            Ok((
                collect.workspace,
                collect.threads,
                collect.reanalyze,
                Box::new(SmbHunter::new(
                    host,
                    port,
                    domain,
                    auth,
                    shares,
                    Arc::clone(config),
                )),
            ))
        }
        Commands::Db(_) | Commands::Review { .. } | Commands::Report { .. } => {
            anyhow::bail!("not a collection command")
        }
    }
}

/// The operator-facing end-of-run summary.
fn print_summary(store: &Arc<Store>, workspace_id: i64, outcome: &CollectionOutcome) {
    let stats: &RunStats = &outcome.stats;
    info!(
        "hosts: {} enumerated, {} failed, {} skipped (already complete)",
        outcome.hosts_started, outcome.hosts_failed, outcome.hosts_skipped
    );
    info!(
        "files: {} inspected, {} above the size gate, {} deduplicated, {} unreadable",
        stats.files_inspected.load(Ordering::Relaxed),
        stats.files_gated.load(Ordering::Relaxed),
        stats.files_deduplicated.load(Ordering::Relaxed),
        stats.files_failed.load(Ordering::Relaxed),
    );
    info!(
        "archives: {} opened, {} skipped",
        stats.archives_opened.load(Ordering::Relaxed),
        stats.archives_skipped.load(Ordering::Relaxed),
    );
    match store.summary(workspace_id) {
        Ok(summary) => info!(
            "workspace totals: {} unique contents, {} paths, matches by relevance: {} high / {} medium / {} low",
            summary.unique_contents,
            summary.paths,
            summary.matches_high,
            summary.matches_medium,
            summary.matches_low,
        ),
        Err(err) => warn!("cannot read the workspace summary: {:#}", err),
    }
    if outcome.cancelled {
        info!("run was cancelled; the partial workspace is preserved and can be resumed");
    }
}
