use crate::adb::{shell_quote, AdbClient};
use crate::error::{Result, TransferError};
use crate::plan::TransferPlan;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Chunk,
    Metadata,
    Bundle,
}

#[derive(Debug, Clone)]
struct TransferItem {
    local: PathBuf,
    remote: String,
    size: u64,
    kind: ItemKind,
}

/// Per-device push result: which transfers still failed after retry, and
/// which manifests came up short on verification.
#[derive(Debug, Default)]
pub struct PushReport {
    pub pushed: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
    pub missing_after_verify: Vec<String>,
}

impl PushReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.missing_after_verify.is_empty()
    }
}

/// Drives the per-device parallel upload: preparation, resume-aware
/// enqueueing, bounded-concurrency push, retry, and post-push verification.
/// One instance is created per device and holds no state between runs
/// beyond the `TransferPlan` it's handed.
pub struct PushEngine {
    adb: Arc<AdbClient>,
}

impl PushEngine {
    pub fn new() -> Self {
        Self { adb: Arc::new(AdbClient::new()) }
    }

    pub async fn push(
        &self,
        serial: &str,
        plan: &TransferPlan,
        cancelled: Arc<AtomicBool>,
    ) -> Result<PushReport> {
        let remote_temp = plan.config.remote_temp_dir.clone();

        self.ensure_remote_dirs(serial, &remote_temp, plan)?;

        let mut items = self.collect_transfers(&remote_temp, plan);
        if plan.config.resume_transfer {
            items = self.filter_resumable(serial, items)?;
        }

        let total = items.len();
        let mut report = PushReport::default();
        report.skipped = total;

        if cancelled.load(Ordering::SeqCst) {
            return Err(TransferError::Cancelled);
        }

        let (succeeded, failed) = self
            .push_parallel(serial, items, plan.config.parallel_processes, cancelled.clone())
            .await?;

        report.pushed = succeeded.len();
        report.skipped = total - succeeded.len() - failed.len();
        let mut still_failed = failed;

        if plan.config.retry_failed_chunks && !still_failed.is_empty() {
            for attempt in 1..=plan.config.max_retries {
                if cancelled.load(Ordering::SeqCst) {
                    return Err(TransferError::Cancelled);
                }
                if still_failed.is_empty() {
                    break;
                }

                debug!("retry pass {} for {} item(s) on {}", attempt, still_failed.len(), serial);
                let retry_items = still_failed.clone();
                let (retried_ok, retried_failed) = self
                    .push_parallel(serial, retry_items, plan.config.parallel_processes, cancelled.clone())
                    .await?;
                report.pushed += retried_ok.len();
                still_failed = retried_failed;
            }
        }

        report.failed = still_failed.iter().map(|i| i.remote.clone()).collect();

        if report.failed.is_empty() {
            report.missing_after_verify = self.verify(serial, &remote_temp, plan, 0)?;
        }

        if plan.config.aggressive_temp_cleanup && report.is_success() {
            self.cleanup_non_persistent(plan);
        }

        info!(
            "push to {} complete: {} pushed, {} skipped, {} failed",
            serial, report.pushed, report.skipped, report.failed.len()
        );

        Ok(report)
    }

    fn ensure_remote_dirs(&self, serial: &str, remote_temp: &str, plan: &TransferPlan) -> Result<()> {
        self.adb
            .shell(serial, &format!("mkdir -p {}", shell_quote(remote_temp)))?;

        for chunk in &plan.chunks {
            let remote_dir = format!("{}/{}", remote_temp, chunk.remote_rel_folder);
            self.adb.shell(serial, &format!("mkdir -p {}", shell_quote(&remote_dir)))?;
        }

        Ok(())
    }

    fn collect_transfers(&self, remote_temp: &str, plan: &TransferPlan) -> Vec<TransferItem> {
        let mut items = Vec::new();

        for chunk in &plan.chunks {
            let remote_dir = format!("{}/{}", remote_temp, chunk.remote_rel_folder);

            for entry in &chunk.manifest.chunks {
                items.push(TransferItem {
                    local: chunk.host_chunk_folder.join(&entry.filename),
                    remote: format!("{}/{}", remote_dir, entry.filename),
                    size: entry.size,
                    kind: ItemKind::Chunk,
                });
            }

            items.push(TransferItem {
                local: chunk.host_chunk_folder.join("chunk_metadata.json"),
                remote: format!("{}/chunk_metadata.json", remote_dir),
                size: 0,
                kind: ItemKind::Metadata,
            });
        }

        for bundle in &plan.bundles {
            let filename = bundle.path.file_name().unwrap().to_string_lossy().to_string();
            items.push(TransferItem {
                local: bundle.path.clone(),
                remote: format!("{}/{}", remote_temp, filename),
                size: bundle.total_size(),
                kind: ItemKind::Bundle,
            });
        }

        items
    }

    /// Metadata files are always transferred; chunks and bundles are
    /// skipped when the remote size already matches.
    fn filter_resumable(&self, serial: &str, items: Vec<TransferItem>) -> Result<Vec<TransferItem>> {
        let mut keep = Vec::with_capacity(items.len());

        for item in items {
            if item.kind == ItemKind::Metadata {
                keep.push(item);
                continue;
            }

            match self.adb.remote_size(serial, &item.remote)? {
                Some(remote_size) if remote_size == item.size => {
                    debug!("resume: skipping {} (already present)", item.remote);
                }
                _ => keep.push(item),
            }
        }

        Ok(keep)
    }

    async fn push_parallel(
        &self,
        serial: &str,
        items: Vec<TransferItem>,
        workers: usize,
        cancelled: Arc<AtomicBool>,
    ) -> Result<(Vec<TransferItem>, Vec<TransferItem>)> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();

        for item in items {
            let adb = self.adb.clone();
            let serial = serial.to_string();
            let semaphore = semaphore.clone();
            let cancelled = cancelled.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if cancelled.load(Ordering::SeqCst) {
                    return (item, false);
                }

                let local = item.local.to_string_lossy().to_string();
                let remote = item.remote.clone();
                let result = tokio::task::spawn_blocking(move || adb.push(&serial, &local, &remote))
                    .await
                    .unwrap_or_else(|e| Err(TransferError::Transport(e.to_string())));

                match result {
                    Ok(()) => (item, true),
                    Err(e) => {
                        warn!("push failed: {}", e);
                        (item, false)
                    }
                }
            });
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut completed = 0usize;

        while let Some(res) = tasks.join_next().await {
            let (item, ok) = res.map_err(|e| TransferError::Fatal(e.to_string()))?;
            completed += 1;
            if completed % 10 == 0 {
                debug!("{} transfers completed", completed);
            }

            if ok {
                succeeded.push(item);
            } else {
                failed.push(item);
            }
        }

        Ok((succeeded, failed))
    }

    /// Verifies every manifest's remote chunk set and, if
    /// `verify_sizes` is set, every declared size. A mismatch triggers one
    /// retry of the missing items followed by at most one re-verification;
    /// depth beyond that is fatal per §4.5.
    fn verify(
        &self,
        serial: &str,
        remote_temp: &str,
        plan: &TransferPlan,
        depth: u32,
    ) -> Result<Vec<String>> {
        if depth > 1 {
            return Err(TransferError::Fatal(
                "verification re-check depth exceeded".to_string(),
            ));
        }

        let mut missing = Vec::new();

        for chunk in &plan.chunks {
            let remote_dir = format!("{}/{}", remote_temp, chunk.remote_rel_folder);
            let listing = self.adb.shell(serial, &format!("ls {}", shell_quote(&remote_dir)))?;
            let present: HashSet<String> = listing.lines().map(|l| l.trim().to_string()).collect();

            for entry in &chunk.manifest.chunks {
                if !present.contains(&entry.filename) {
                    missing.push(format!("{}/{}", remote_dir, entry.filename));
                    continue;
                }

                if plan.config.verify_sizes {
                    let remote_path = format!("{}/{}", remote_dir, entry.filename);
                    match self.adb.remote_size(serial, &remote_path)? {
                        Some(size) if size == entry.size => {}
                        _ => missing.push(remote_path),
                    }
                }
            }
        }

        for bundle in &plan.bundles {
            let filename = bundle.path.file_name().unwrap().to_string_lossy().to_string();
            let remote_path = format!("{}/{}", remote_temp, filename);
            match self.adb.remote_size(serial, &remote_path)? {
                Some(size) if size == bundle.total_size() => {}
                _ => missing.push(remote_path),
            }
        }

        if missing.is_empty() {
            return Ok(Vec::new());
        }

        warn!("{} item(s) missing or mismatched on verify, retrying once", missing.len());

        for remote_path in &missing {
            if let Some(item) = self.find_local_for_remote(plan, remote_temp, remote_path) {
                let _ = self.adb.push(serial, &item.local.to_string_lossy(), &item.remote);
            }
        }

        self.verify(serial, remote_temp, plan, depth + 1)
    }

    fn find_local_for_remote(&self, plan: &TransferPlan, remote_temp: &str, remote_path: &str) -> Option<TransferItem> {
        self.collect_transfers(remote_temp, plan)
            .into_iter()
            .find(|i| i.remote == remote_path)
    }

    /// Deletes non-persistent chunk `.bin` files after a successful verify,
    /// preserving metadata and anything whose manifest carries a
    /// `persistent_source` (those are never touched by this engine).
    fn cleanup_non_persistent(&self, plan: &TransferPlan) {
        for chunk in &plan.chunks {
            if chunk.manifest.persistent_source.is_some() {
                continue;
            }

            for entry in &chunk.manifest.chunks {
                let path = chunk.host_chunk_folder.join(&entry.filename);
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!("cleanup: could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Default for PushEngine {
    fn default() -> Self {
        Self::new()
    }
}
