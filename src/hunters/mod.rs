//! Enumeration drivers.
//!
//! Four interchangeable drivers walk a protocol endpoint and emit file
//! references onto the shared work queue. A driver transfers bytes only
//! for files that pass the size gate; oversized files are submitted with
//! their metadata so name and path rules can still judge them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use crossbeam::channel::Sender;

use crate::models::{FileReference, HostSpec};

/// FTP driver
pub mod ftp;

/// Local directory tree driver
pub mod local;

/// NFS driver
pub mod nfs;

/// SMB driver
pub mod smb;

/// Producer-side handle on the bounded work queue. `submit` blocks when
/// the analyzer pool is saturated, which is the backpressure that keeps a
/// fast driver from outrunning analysis.
pub struct FileSink {
    tx: Sender<FileReference>,
    pending: Arc<AtomicUsize>,
    cancel: Arc<AtomicBool>,
}

impl FileSink {
    pub fn new(
        tx: Sender<FileReference>,
        pending: Arc<AtomicUsize>,
        cancel: Arc<AtomicBool>,
    ) -> FileSink {
        FileSink { tx, pending, cancel }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Queue a reference for analysis. Returns false when the run is
    /// cancelled or the pool is gone; drivers stop enumerating then.
    pub fn submit(&self, reference: FileReference) -> bool {
        if self.cancelled() {
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(reference).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }
}

/// The driver contract. `connect` performs session setup and fails fast
/// on protocol refusal; `enumerate` walks the roots and submits file
/// references. A clean `enumerate` return (without cancellation) marks
/// the host complete, making a re-run of the same workspace/host a cheap
/// no-op.
pub trait Hunter: Send {
    fn host(&self) -> HostSpec;

    fn connect(&mut self) -> Result<()>;

    fn enumerate(&mut self, sink: &FileSink, host_id: i64) -> Result<()>;
}
