use crate::error::Result;
use crate::scanner::FileEntry;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A packed archive of small files: its on-disk path and the source
/// entries it contains, in pack order.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub path: PathBuf,
    pub entries: Vec<FileEntry>,
}

impl Bundle {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Bin-packs small files by First-Fit Decreasing and writes each bin out as
/// a deflate-compressed zip archive.
pub struct Bundler;

impl Bundler {
    /// Partitions `files` into bins bounded by `bundle_size`: sort
    /// descending by size, then place each file in the first bin whose
    /// running total plus the file still fits, else open a new bin. A file
    /// larger than `bundle_size` gets a bin to itself.
    pub fn pack(files: &[FileEntry], bundle_size: u64) -> Vec<Vec<FileEntry>> {
        let mut sorted: Vec<FileEntry> = files.to_vec();
        sorted.sort_by(|a, b| b.size.cmp(&a.size));

        let mut bins: Vec<Vec<FileEntry>> = Vec::new();
        let mut totals: Vec<u64> = Vec::new();

        for file in sorted {
            let mut placed = false;
            for (bin, total) in bins.iter_mut().zip(totals.iter_mut()) {
                if *total + file.size <= bundle_size {
                    *total += file.size;
                    bin.push(file.clone());
                    placed = true;
                    break;
                }
            }

            if !placed {
                totals.push(file.size);
                bins.push(vec![file]);
            }
        }

        bins
    }

    /// Writes each bin as `bundle_batch_NNN.zip` (or `bundle_batch.zip` when
    /// there's exactly one bin) under `scratch_dir`, with entry names equal
    /// to each file's source-relative path using forward slashes.
    pub fn write_bundles(bins: Vec<Vec<FileEntry>>, scratch_dir: &Path) -> Result<Vec<Bundle>> {
        std::fs::create_dir_all(scratch_dir)?;

        let single = bins.len() == 1;
        let mut bundles = Vec::with_capacity(bins.len());

        for (index, entries) in bins.into_iter().enumerate() {
            let filename = if single {
                "bundle_batch.zip".to_string()
            } else {
                format!("bundle_batch_{:03}.zip", index)
            };
            let path = scratch_dir.join(&filename);

            Self::write_archive(&path, &entries)?;
            debug!("wrote {} ({} files)", path.display(), entries.len());

            bundles.push(Bundle { path, entries });
        }

        Ok(bundles)
    }

    fn write_archive(path: &Path, entries: &[FileEntry]) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(1));

        for entry in entries {
            writer.start_file(entry.relative.clone(), options)?;
            let mut source = File::open(&entry.absolute)?;
            let mut buf = Vec::with_capacity(entry.size as usize);
            source.read_to_end(&mut buf)?;
            writer.write_all(&buf)?;
        }

        writer.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(dir: &Path, name: &str, size: u64) -> FileEntry {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; size as usize]).unwrap();
        FileEntry {
            absolute: path,
            relative: name.to_string(),
            size,
        }
    }

    #[test]
    fn test_ffd_packing_scenario() {
        let dir = tempdir().unwrap();
        let files = vec![
            entry(dir.path(), "f40.bin", 40 * 1024 * 1024),
            entry(dir.path(), "f30.bin", 30 * 1024 * 1024),
            entry(dir.path(), "f20.bin", 20 * 1024 * 1024),
            entry(dir.path(), "f15.bin", 15 * 1024 * 1024),
            entry(dir.path(), "f5.bin", 5 * 1024 * 1024),
        ];

        let bins = Bundler::pack(&files, 50 * 1024 * 1024);

        assert_eq!(bins.len(), 3);
        let sizes: Vec<Vec<u64>> = bins
            .iter()
            .map(|b| b.iter().map(|f| f.size / (1024 * 1024)).collect())
            .collect();
        assert_eq!(sizes, vec![vec![40, 5], vec![30, 15], vec![20]]);
    }

    #[test]
    fn test_partition_covers_every_file_exactly_once() {
        let dir = tempdir().unwrap();
        let files: Vec<FileEntry> = (0..9)
            .map(|i| entry(dir.path(), &format!("f{}.bin", i), (i + 1) * 1024 * 1024))
            .collect();

        let bins = Bundler::pack(&files, 10 * 1024 * 1024);
        let total_in_bins: usize = bins.iter().map(|b| b.len()).sum();
        assert_eq!(total_in_bins, files.len());

        for bin in &bins {
            let sum: u64 = bin.iter().map(|f| f.size).sum();
            assert!(sum <= 10 * 1024 * 1024 || bin.len() == 1);
        }
    }

    #[test]
    fn test_oversized_single_file_gets_own_bin() {
        let dir = tempdir().unwrap();
        let files = vec![entry(dir.path(), "huge.bin", 80 * 1024 * 1024)];
        let bins = Bundler::pack(&files, 50 * 1024 * 1024);
        assert_eq!(bins.len(), 1);
        assert_eq!(bins[0].len(), 1);
    }

    #[test]
    fn test_write_bundles_single_bin_uses_unnumbered_name() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let files = vec![entry(dir.path(), "a.bin", 100)];
        let bins = Bundler::pack(&files, 1024);
        let bundles = Bundler::write_bundles(bins, &scratch).unwrap();

        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].path.file_name().unwrap(), "bundle_batch.zip");
        assert!(bundles[0].path.exists());
    }
}
