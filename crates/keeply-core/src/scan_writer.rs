//! Scan writer (C4): a single worker thread fed by a bounded queue of
//! observed-file records, committing in batches per the policy in §4.4.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::BatchConfig;
use crate::error::Result;
use crate::store::{InventoryObservation, MetadataStore};

enum ScanMessage {
    Observation(InventoryObservation),
    EndOfStream,
}

pub struct ScanWriterOutcome {
    pub store: MetadataStore,
    pub rows_committed: u64,
}

/// Producer-facing handle: a bounded sender plus the join handle for the
/// worker thread that owns the metadata store connection for the duration
/// of the scan.
pub struct ScanWriterHandle {
    sender: Sender<ScanMessage>,
    enqueue_timeout: Duration,
    join: JoinHandle<Result<ScanWriterOutcome>>,
}

impl ScanWriterHandle {
    /// Starts the worker thread, moving `store` into it for the duration of
    /// the scan; the store is handed back in [`ScanWriterOutcome`] once
    /// [`Self::finish`] returns.
    pub fn spawn(store: MetadataStore, batch: BatchConfig, cancel: Arc<AtomicBool>) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(batch.queue_capacity);
        let enqueue_timeout = batch.enqueue_timeout;
        let join = std::thread::spawn(move || {
            run(store, &receiver, batch.batch_size, batch.commit_latency, cancel.as_ref())
        });
        ScanWriterHandle { sender, enqueue_timeout, join }
    }

    /// Timed enqueue (<= the configured `enqueue_timeout`). Returns `false`
    /// if the send could not complete in time; producers are expected to
    /// re-check the shared cancel flag when this happens, per §4.4.
    pub fn send(&self, observation: InventoryObservation) -> bool {
        self.sender
            .send_timeout(ScanMessage::Observation(observation), self.enqueue_timeout)
            .is_ok()
    }

    /// Signals end-of-stream and blocks until the worker has drained and
    /// committed everything, returning the store and the committed row
    /// count.
    pub fn finish(self) -> Result<ScanWriterOutcome> {
        let _ = self.sender.send(ScanMessage::EndOfStream);
        self.join
            .join()
            .unwrap_or_else(|_| Err(crate::error::KeeplyError::Config("scan writer thread panicked".into())))
    }
}

fn run(
    mut store: MetadataStore,
    receiver: &Receiver<ScanMessage>,
    batch_size: usize,
    commit_latency: Duration,
    cancel: &AtomicBool,
) -> Result<ScanWriterOutcome> {
    let mut batch = Vec::with_capacity(batch_size);
    let mut last_commit = Instant::now();
    let mut rows_committed = 0u64;
    let mut ended = false;

    loop {
        let wait = commit_latency
            .checked_sub(last_commit.elapsed())
            .unwrap_or(Duration::from_millis(1))
            .max(Duration::from_millis(1));

        match receiver.recv_timeout(wait) {
            Ok(ScanMessage::Observation(obs)) => batch.push(obs),
            Ok(ScanMessage::EndOfStream) => ended = true,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => ended = true,
        }

        let batch_full = batch.len() >= batch_size;
        let latency_elapsed = !batch.is_empty() && last_commit.elapsed() >= commit_latency;
        let draining = ended && !batch.is_empty();

        if batch_full || latency_elapsed || draining {
            if let Err(e) = store.apply_inventory_batch(&batch) {
                cancel.store(true, Ordering::SeqCst);
                return Err(e);
            }
            rows_committed += batch.len() as u64;
            batch.clear();
            last_commit = Instant::now();
        }

        if ended && batch.is_empty() {
            break;
        }
    }

    Ok(ScanWriterOutcome { store, rows_committed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::atomic::AtomicBool;

    fn test_store(dir: &std::path::Path) -> MetadataStore {
        let root = dir.join("src");
        let dest = dir.join("dst");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        let mut cfg = EngineConfig::new(root, dest);
        cfg.encryption_enabled = false;
        MetadataStore::open(&cfg, "pw").unwrap()
    }

    #[test]
    fn batches_commit_on_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = ScanWriterHandle::spawn(store, BatchConfig::default(), cancel);

        let scan_id = 1;
        for i in 0..10 {
            let ok = handle.send(InventoryObservation {
                root_path: "/src".into(),
                path_rel: format!("file-{i}.txt"),
                name: format!("file-{i}.txt"),
                size_bytes: 10,
                modified_millis: 1000,
                created_millis: 1000,
                last_scan_id: scan_id,
            });
            assert!(ok);
        }

        let outcome = handle.finish().unwrap();
        assert_eq!(outcome.rows_committed, 10);
        let changed = outcome.store.changed_set(999).unwrap();
        assert!(changed.is_empty());
    }
}
