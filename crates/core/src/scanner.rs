use crate::config::TransferConfig;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One regular file found under the source tree: its absolute host path,
/// its path relative to the source root (forward-slash, used as the key
/// for bundle entries and remote layout), and its size in bytes.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub absolute: PathBuf,
    pub relative: String,
    pub size: u64,
}

/// Large files (destined for the Chunker) and small files (destined for the
/// Bundler), partitioned by `small_file_threshold`.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub large: Vec<FileEntry>,
    pub small: Vec<FileEntry>,
}

impl ScanResult {
    pub fn total_files(&self) -> usize {
        self.large.len() + self.small.len()
    }
}

/// Walks a source tree and classifies its files for the transfer pipeline.
pub struct Scanner;

impl Scanner {
    /// Walks `source_root`, skipping any directory whose name ends in
    /// `_chunks` (our own chunk-manifest artifacts from a prior run), then
    /// optionally sorts by ascending size (SJF) before partitioning into
    /// large/small by `config.small_file_threshold`.
    pub fn scan(source_root: &Path, config: &TransferConfig) -> Result<ScanResult> {
        debug!("scanning {}", source_root.display());

        let mut entries = Vec::new();

        let walker = WalkDir::new(source_root).into_iter().filter_entry(|e| {
            if e.file_type().is_dir() {
                !e.file_name().to_string_lossy().ends_with("_chunks")
            } else {
                true
            }
        });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let absolute = entry.path().to_path_buf();
            let relative = absolute
                .strip_prefix(source_root)
                .unwrap_or(&absolute)
                .to_string_lossy()
                .replace('\\', "/");
            let size = entry.metadata()?.len();

            entries.push(FileEntry { absolute, relative, size });
        }

        if config.sjf_scheduling {
            entries.sort_by_key(|f| f.size);
        }

        let mut result = ScanResult::default();
        for entry in entries {
            if entry.size >= config.small_file_threshold {
                result.large.push(entry);
            } else {
                result.small.push(entry);
            }
        }

        debug!(
            "scan found {} large file(s), {} small file(s)",
            result.large.len(),
            result.small.len()
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_classifies_by_threshold() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("small.bin"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("large.bin"), vec![0u8; 1000]).unwrap();

        let mut config = TransferConfig::default();
        config.small_file_threshold = 500;

        let result = Scanner::scan(dir.path(), &config).unwrap();
        assert_eq!(result.small.len(), 1);
        assert_eq!(result.large.len(), 1);
        assert_eq!(result.small[0].relative, "small.bin");
        assert_eq!(result.large[0].relative, "large.bin");
    }

    #[test]
    fn test_skips_chunks_directories() {
        let dir = tempdir().unwrap();
        let chunks_dir = dir.path().join("a_chunks");
        fs::create_dir(&chunks_dir).unwrap();
        fs::write(chunks_dir.join("chunk_0000.bin"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 10]).unwrap();

        let config = TransferConfig::default();
        let result = Scanner::scan(dir.path(), &config).unwrap();
        assert_eq!(result.total_files(), 1);
        assert_eq!(result.small[0].relative, "a.bin");
    }

    #[test]
    fn test_sjf_sorts_ascending() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.bin"), vec![0u8; 200]).unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 50]).unwrap();

        let mut config = TransferConfig::default();
        config.small_file_threshold = 10_000;
        config.sjf_scheduling = true;

        let result = Scanner::scan(dir.path(), &config).unwrap();
        assert_eq!(result.small[0].size, 50);
        assert_eq!(result.small[1].size, 200);
    }

    #[test]
    fn test_relative_paths_preserve_nesting() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("A/B")).unwrap();
        fs::write(dir.path().join("A/B/c.dat"), vec![0u8; 10]).unwrap();

        let config = TransferConfig::default();
        let result = Scanner::scan(dir.path(), &config).unwrap();
        assert_eq!(result.small[0].relative, "A/B/c.dat");
    }
}
