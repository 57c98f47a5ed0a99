//! Run orchestration: the bounded work queue, the analyzer pool and the
//! driver threads.
//!
//! One producer thread per host feeds the bounded file queue; archive
//! members re-enter through a second, unbounded queue so a worker can
//! never wedge the pool by re-posting members while the driver queue is
//! full. Workers drain members first, which keeps archive work flowing
//! depth-first.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::analyzer::Analyzer;
use crate::config::{HuntConfig, RuleSet};
use crate::constants::{DRAIN_DEADLINE_SECS, QUEUE_DEPTH_FACTOR, WORKER_POLL_INTERVAL_MS};
use crate::hunters::{FileSink, Hunter};
use crate::models::{FileReference, RunStats};
use crate::store::Store;

pub struct CollectionOptions {
    /// Analyzer pool size; defaults to the CPU count.
    pub workers: usize,
    /// Enumerate hosts even when their completed flag is set.
    pub reanalyze: bool,
    /// Seconds to wait for in-flight analyses on shutdown.
    pub drain_deadline_secs: u64,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            workers: num_cpus::get(),
            reanalyze: false,
            drain_deadline_secs: DRAIN_DEADLINE_SECS,
        }
    }
}

#[derive(Debug)]
pub struct CollectionOutcome {
    pub cancelled: bool,
    /// Hosts whose driver connected and ran.
    pub hosts_started: usize,
    /// Hosts whose driver failed to connect or aborted.
    pub hosts_failed: usize,
    /// Hosts skipped because a previous run completed them.
    pub hosts_skipped: usize,
    pub stats: Arc<RunStats>,
}

/// Run a collection: start one driver per hunter, analyze everything they
/// emit, and mark hosts complete on clean driver exit.
///
/// Returns an error only on fatal database loss; driver failures are
/// reported through the outcome so the other drivers keep running.
pub fn run_collection(
    store: Arc<Store>,
    config: Arc<HuntConfig>,
    rules: Arc<RuleSet>,
    workspace_id: i64,
    hunters: Vec<Box<dyn Hunter>>,
    options: CollectionOptions,
    cancel: Arc<AtomicBool>,
) -> Result<CollectionOutcome> {
    let rule_ids = Arc::new(store.snapshot_rules(&rules)?);
    let stats = Arc::new(RunStats::default());
    let pending = Arc::new(AtomicUsize::new(0));
    let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let workers = options.workers.max(1);
    let (file_tx, file_rx) = bounded::<FileReference>(workers * QUEUE_DEPTH_FACTOR);
    let (member_tx, member_rx) = unbounded::<FileReference>();

    // Analyzer pool
    let mut worker_handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let analyzer = Analyzer::new(
            Arc::clone(&store),
            Arc::clone(&rules),
            Arc::clone(&config),
            Arc::clone(&rule_ids),
            workspace_id,
            member_tx.clone(),
            Arc::clone(&pending),
            Arc::clone(&cancel),
            Arc::clone(&stats),
        );
        let file_rx = file_rx.clone();
        let member_rx = member_rx.clone();
        let pending = Arc::clone(&pending);
        let cancel = Arc::clone(&cancel);
        let fatal = Arc::clone(&fatal);
        worker_handles.push(thread::spawn(move || {
            analysis_worker(
                worker_id, analyzer, file_rx, member_rx, pending, cancel, fatal,
            );
        }));
    }
    drop(member_tx);
    drop(file_rx);

    // Driver threads, one per host
    let mut driver_handles = Vec::new();
    let mut hosts_skipped = 0;
    for mut hunter in hunters {
        let host = hunter.host();
        let host_id = store.add_host(workspace_id, &host)?;
        if !options.reanalyze && store.host_completed(host_id)? {
            info!("skipping {} as it was already enumerated", host);
            hosts_skipped += 1;
            continue;
        }
        let sink = FileSink::new(file_tx.clone(), Arc::clone(&pending), Arc::clone(&cancel));
        driver_handles.push(thread::spawn(move || {
            let result = hunter
                .connect()
                .and_then(|_| hunter.enumerate(&sink, host_id));
            (host, host_id, result)
        }));
    }
    drop(file_tx);

    // Collect driver results; mark clean exits complete
    let mut hosts_started = 0;
    let mut hosts_failed = 0;
    for handle in driver_handles {
        let (host, host_id, result) = handle
            .join()
            .map_err(|_| anyhow!("driver thread panicked"))?;
        match result {
            Ok(()) if !cancel.load(Ordering::Relaxed) => {
                hosts_started += 1;
                store.mark_host_complete(host_id)?;
                debug!("driver for {} finished cleanly", host);
            }
            Ok(()) => {
                hosts_started += 1;
                info!("driver for {} stopped by cancellation", host);
            }
            Err(err) => {
                hosts_failed += 1;
                error!("driver for {} failed: {:#}", host, err);
            }
        }
    }

    // Drain in-flight analyses, then force the pool down at the deadline
    let deadline = Instant::now() + Duration::from_secs(options.drain_deadline_secs);
    while pending.load(Ordering::SeqCst) > 0 && !cancel.load(Ordering::Relaxed) {
        if Instant::now() >= deadline {
            warn!(
                "drain deadline reached with {} analyses outstanding",
                pending.load(Ordering::SeqCst)
            );
            cancel.store(true, Ordering::Relaxed);
            break;
        }
        thread::sleep(Duration::from_millis(WORKER_POLL_INTERVAL_MS));
    }
    for handle in worker_handles {
        let _ = handle.join();
    }

    if let Some(message) = fatal.lock().unwrap_or_else(|e| e.into_inner()).take() {
        return Err(anyhow!(message));
    }
    Ok(CollectionOutcome {
        cancelled: cancel.load(Ordering::Relaxed),
        hosts_started,
        hosts_failed,
        hosts_skipped,
        stats,
    })
}

/// One analyzer worker. Exits when cancelled, or when the driver queue is
/// closed and no work is queued or in flight anywhere in the pool.
fn analysis_worker(
    worker_id: usize,
    analyzer: Analyzer,
    file_rx: Receiver<FileReference>,
    member_rx: Receiver<FileReference>,
    pending: Arc<AtomicUsize>,
    cancel: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<String>>>,
) {
    let poll = Duration::from_millis(WORKER_POLL_INTERVAL_MS);
    let mut drivers_running = true;
    let mut processed: u64 = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        // Archive members first: finishes opened containers before new files
        if let Ok(reference) = member_rx.try_recv() {
            process(&analyzer, reference, &pending, &cancel, &fatal);
            processed += 1;
            continue;
        }
        if drivers_running {
            match file_rx.recv_timeout(poll) {
                Ok(reference) => {
                    process(&analyzer, reference, &pending, &cancel, &fatal);
                    processed += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => drivers_running = false,
            }
        } else {
            match member_rx.recv_timeout(poll) {
                Ok(reference) => {
                    process(&analyzer, reference, &pending, &cancel, &fatal);
                    processed += 1;
                }
                // Quiet queues and nothing in flight: the run is over
                Err(RecvTimeoutError::Timeout) => {
                    if pending.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
    debug!("worker {} exiting after {} files", worker_id, processed);
}

fn process(
    analyzer: &Analyzer,
    reference: FileReference,
    pending: &AtomicUsize,
    cancel: &AtomicBool,
    fatal: &Mutex<Option<String>>,
) {
    let result = analyzer.analyze(reference);
    pending.fetch_sub(1, Ordering::SeqCst);
    if let Err(err) = result {
        error!("aborting run: {:#}", err);
        *fatal.lock().unwrap_or_else(|e| e.into_inner()) = Some(format!("{:#}", err));
        cancel.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ByteFetcher, HostSpec, Protocol};

    /// Emits a fixed set of in-memory files.
    struct StaticHunter {
        files: Vec<(String, &'static [u8])>,
        fail_connect: bool,
    }

    impl Hunter for StaticHunter {
        fn host(&self) -> HostSpec {
            HostSpec {
                protocol: Protocol::Local,
                address: "127.0.0.1".to_string(),
                port: None,
                share: None,
            }
        }

        fn connect(&mut self) -> Result<()> {
            if self.fail_connect {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }

        fn enumerate(&mut self, sink: &FileSink, host_id: i64) -> Result<()> {
            for (path, content) in &self.files {
                let bytes = content.to_vec();
                let fetcher: ByteFetcher = Box::new(move || Ok(bytes));
                let reference = FileReference {
                    host_id,
                    full_path: path.clone(),
                    archive_chain: Vec::new(),
                    size: content.len() as u64,
                    fetcher,
                    access_time: None,
                    modified_time: None,
                    creation_time: None,
                };
                if !sink.submit(reference) {
                    break;
                }
            }
            Ok(())
        }
    }

    fn run(
        store: &Arc<Store>,
        hunters: Vec<Box<dyn Hunter>>,
        reanalyze: bool,
    ) -> CollectionOutcome {
        let config = Arc::new(HuntConfig::default());
        let rules = Arc::new(config.compile_rules().unwrap());
        let workspace_id = store.add_workspace("coord").unwrap();
        run_collection(
            Arc::clone(store),
            config,
            rules,
            workspace_id,
            hunters,
            CollectionOptions {
                workers: 2,
                reanalyze,
                drain_deadline_secs: 10,
            },
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn clean_run_marks_host_complete_and_rerun_skips() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init_schema().unwrap();
        let hunter = || {
            Box::new(StaticHunter {
                files: vec![
                    ("/srv/a.txt".to_string(), b"password=hunter2\n".as_slice()),
                    ("/srv/b.txt".to_string(), b"password=hunter2\n".as_slice()),
                ],
                fail_connect: false,
            }) as Box<dyn Hunter>
        };
        let outcome = run(&store, vec![hunter()], false);
        assert_eq!(outcome.hosts_started, 1);
        assert_eq!(outcome.hosts_failed, 0);
        assert!(!outcome.cancelled);

        let workspace_id = store.workspace_id("coord").unwrap().unwrap();
        let summary = store.summary(workspace_id).unwrap();
        assert_eq!(summary.unique_contents, 1);
        assert_eq!(summary.paths, 2);
        assert_eq!(summary.hosts_completed, 1);

        // Idempotent resume: the driver is skipped entirely
        let second = run(&store, vec![hunter()], false);
        assert_eq!(second.hosts_skipped, 1);
        assert_eq!(second.hosts_started, 0);
        let summary = store.summary(workspace_id).unwrap();
        assert_eq!(summary.paths, 2);
    }

    #[test]
    fn failed_driver_leaves_host_incomplete() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init_schema().unwrap();
        let outcome = run(
            &store,
            vec![Box::new(StaticHunter {
                files: Vec::new(),
                fail_connect: true,
            })],
            false,
        );
        assert_eq!(outcome.hosts_failed, 1);
        assert_eq!(outcome.hosts_started, 0);
        let workspace_id = store.workspace_id("coord").unwrap().unwrap();
        assert_eq!(store.summary(workspace_id).unwrap().hosts_completed, 0);
    }

    #[test]
    fn reanalyze_runs_a_completed_host_again_without_new_rows() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init_schema().unwrap();
        let hunter = || {
            Box::new(StaticHunter {
                files: vec![("/srv/a.txt".to_string(), b"password=hunter2\n".as_slice())],
                fail_connect: false,
            }) as Box<dyn Hunter>
        };
        run(&store, vec![hunter()], false);
        let outcome = run(&store, vec![hunter()], true);
        assert_eq!(outcome.hosts_started, 1);
        let workspace_id = store.workspace_id("coord").unwrap().unwrap();
        let summary = store.summary(workspace_id).unwrap();
        // Dedup keeps the file unique; the re-run adds one more path row
        assert_eq!(summary.unique_contents, 1);
        assert_eq!(summary.paths, 2);
    }
}
