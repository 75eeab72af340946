use crate::bundler::{Bundle, Bundler};
use crate::chunker::{ChunkManifest, Chunker};
use crate::config::TransferConfig;
use crate::device::DeviceTarget;
use crate::error::Result;
use crate::scanner::Scanner;
use std::path::{Path, PathBuf};
use tracing::info;

/// A chunked large file paired with where its chunks live on the host and
/// where they should land under the device's remote temp directory.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub manifest: ChunkManifest,
    pub host_chunk_folder: PathBuf,
    pub remote_rel_folder: String,
}

/// The immutable, per-run aggregate shared read-only across every device
/// thread: large-file manifests, small-file bundles, the device list, and
/// the configuration the plan was built under.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub chunks: Vec<PreparedChunk>,
    pub bundles: Vec<Bundle>,
    pub devices: Vec<DeviceTarget>,
    pub config: TransferConfig,
}

impl TransferPlan {
    /// Scans `source_root`, chunks every large file (reusing matching
    /// on-disk chunks), bin-packs and zips every small file into
    /// `scratch_dir`, and freezes the result alongside the target device
    /// list. Nothing past this point mutates the plan.
    pub fn prepare(
        source_root: &Path,
        scratch_dir: &Path,
        devices: Vec<DeviceTarget>,
        config: TransferConfig,
    ) -> Result<Self> {
        let scan = Scanner::scan(source_root, &config)?;
        info!(
            "scanned {} large file(s), {} small file(s)",
            scan.large.len(),
            scan.small.len()
        );

        let mut chunks = Vec::with_capacity(scan.large.len());
        for file in &scan.large {
            let manifest = Chunker::chunk_file(file, config.chunk_size, true, scratch_dir)?;
            let host_chunk_folder = Chunker::host_folder(file, true, scratch_dir);
            let remote_rel_folder = manifest.chunk_folder.clone();

            chunks.push(PreparedChunk {
                manifest,
                host_chunk_folder,
                remote_rel_folder,
            });
        }

        let bins = Bundler::pack(&scan.small, config.bundle_size);
        let bundles = Bundler::write_bundles(bins, scratch_dir)?;

        Ok(Self {
            chunks,
            bundles,
            devices,
            config,
        })
    }
}

/// Per-device outcome for one of the two pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok,
    Failed(String),
    NotAttempted,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }
}

/// End-of-run, per-device report: whether push and reassembly each
/// succeeded. Partial failure is first-class — one device's entry here
/// never depends on another's.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub serial: String,
    pub push: Outcome,
    pub reassembly: Outcome,
}

impl TransferSummary {
    pub fn not_attempted(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            push: Outcome::NotAttempted,
            reassembly: Outcome::NotAttempted,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.push.is_ok() && self.reassembly.is_ok()
    }
}
