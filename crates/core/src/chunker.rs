use crate::error::{Result, TransferError};
use crate::scanner::FileEntry;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Metadata for one chunk of a chunked file, in on-disk order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkEntry {
    pub index: u32,
    pub filename: String,
    pub size: u64,
    pub md5: String,
}

/// The sidecar manifest for one large file, persisted as
/// `<stem>_chunks/chunk_metadata.json` next to the source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkManifest {
    pub original_rel_path: String,
    pub original_size: u64,
    pub original_md5: String,
    pub chunk_size: u64,
    pub num_chunks: u32,
    pub chunk_folder: String,
    pub persistent_source: Option<String>,
    pub chunks: Vec<ChunkEntry>,
}

const METADATA_FILE: &str = "chunk_metadata.json";

/// Splits large files into fixed-size chunks with a sidecar manifest,
/// reusing on-disk chunks across runs when the source is unchanged.
pub struct Chunker;

impl Chunker {
    /// Produces a `ChunkManifest` for `file`, writing chunk files to disk if
    /// they don't already exist (or no longer match), per §4.2.
    pub fn chunk_file(
        file: &FileEntry,
        chunk_size: u64,
        persistent: bool,
        scratch_root: &Path,
    ) -> Result<ChunkManifest> {
        let chunk_folder = Self::host_folder(file, persistent, scratch_root);
        let metadata_path = chunk_folder.join(METADATA_FILE);

        if metadata_path.exists() {
            if let Some(manifest) = Self::try_reuse(&metadata_path, &chunk_folder, file)? {
                debug!("reusing chunk manifest for {}", file.relative);
                return Ok(manifest);
            }
            debug!("stale chunks for {}, rebuilding", file.relative);
            fs::remove_dir_all(&chunk_folder)?;
        }

        Self::build(file, chunk_size, persistent, &chunk_folder)
    }

    /// Where this file's chunks live on the host: next to the source file
    /// when `persistent`, or mirrored under `scratch_root` otherwise.
    pub fn host_folder(file: &FileEntry, persistent: bool, scratch_root: &Path) -> PathBuf {
        let stem = file
            .absolute
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        if persistent {
            file.absolute
                .parent()
                .map(|p| p.join(format!("{}_chunks", stem)))
                .unwrap_or_else(|| PathBuf::from(format!("{}_chunks", stem)))
        } else {
            let rel_parent = Path::new(&file.relative).parent().unwrap_or(Path::new(""));
            scratch_root.join(rel_parent).join(format!("{}_chunks", stem))
        }
    }

    /// The source-relative folder this file's manifest targets on the
    /// device, e.g. `sub/dir/name_chunks` — never an absolute host path.
    fn relative_chunk_folder(file: &FileEntry) -> String {
        let rel_parent = Path::new(&file.relative).parent().unwrap_or(Path::new(""));
        let stem = Path::new(&file.relative)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        if rel_parent.as_os_str().is_empty() {
            format!("{}_chunks", stem)
        } else {
            format!("{}/{}_chunks", rel_parent.to_string_lossy().replace('\\', "/"), stem)
        }
    }

    /// Attempts the reuse path: if size, full-file MD5, and on-disk chunk
    /// count all match the persisted manifest, returns it unchanged save
    /// for the `chunk_folder` field. Does not re-hash individual on-disk
    /// chunks (see the open question on reuse verification).
    fn try_reuse(
        metadata_path: &Path,
        chunk_folder: &Path,
        file: &FileEntry,
    ) -> Result<Option<ChunkManifest>> {
        let content = fs::read_to_string(metadata_path)?;
        let mut manifest: ChunkManifest = serde_json::from_str(&content)?;

        if manifest.original_size != file.size {
            return Ok(None);
        }

        let current_md5 = Self::hash_file(&file.absolute)?;
        if manifest.original_md5 != current_md5 {
            return Ok(None);
        }

        let on_disk_chunks = fs::read_dir(chunk_folder)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("chunk_") && name.ends_with(".bin")
            })
            .count();

        if on_disk_chunks as u32 != manifest.num_chunks {
            return Ok(None);
        }

        manifest.chunk_folder = Self::relative_chunk_folder(file);
        Ok(Some(manifest))
    }

    /// Builds chunks from scratch: streams the full-file MD5, then rewrites
    /// the file in fixed `chunk_size` windows, writing `chunk_metadata.json`
    /// only after every chunk has landed so its presence implies success.
    fn build(file: &FileEntry, chunk_size: u64, persistent: bool, chunk_folder: &Path) -> Result<ChunkManifest> {
        fs::create_dir_all(chunk_folder)?;

        let original_md5 = Self::hash_file(&file.absolute)?;
        let original_size = file.size;
        let num_chunks = ((original_size + chunk_size - 1) / chunk_size).max(1) as u32;

        let mut source = File::open(&file.absolute)?;
        let mut chunks = Vec::with_capacity(num_chunks as usize);
        let mut remaining = original_size;

        for index in 0..num_chunks {
            let this_size = remaining.min(chunk_size);
            let mut buf = vec![0u8; this_size as usize];
            source.read_exact(&mut buf)?;

            let filename = format!("chunk_{:04}.bin", index);
            let mut hasher = md5::Context::new();
            hasher.consume(&buf);
            let chunk_md5 = format!("{:x}", hasher.compute());

            fs::write(chunk_folder.join(&filename), &buf)?;

            chunks.push(ChunkEntry {
                index,
                filename,
                size: this_size,
                md5: chunk_md5,
            });

            remaining -= this_size;
        }

        let manifest = ChunkManifest {
            original_rel_path: file.relative.clone(),
            original_size,
            original_md5,
            chunk_size,
            num_chunks,
            chunk_folder: Self::relative_chunk_folder(file),
            persistent_source: if persistent {
                Some(file.absolute.to_string_lossy().to_string())
            } else {
                None
            },
            chunks,
        };

        let metadata_json = serde_json::to_string_pretty(&manifest)?;
        fs::write(chunk_folder.join(METADATA_FILE), metadata_json)?;

        Ok(manifest)
    }

    fn hash_file(path: &Path) -> Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = md5::Context::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.consume(&buffer[..read]);
        }

        Ok(format!("{:x}", hasher.compute()))
    }
}

/// Concatenates `chunk_0000..chunk_(N-1)` back into the original file,
/// verifying the invariant the manifest round-trip test exercises.
pub fn reassemble_to(manifest: &ChunkManifest, chunk_folder: &Path, dest: &Path) -> Result<()> {
    let mut out = File::create(dest)?;

    for entry in &manifest.chunks {
        let mut chunk = File::open(chunk_folder.join(&entry.filename))?;
        let mut buf = Vec::with_capacity(entry.size as usize);
        chunk.read_to_end(&mut buf)?;

        if buf.len() as u64 != entry.size {
            return Err(TransferError::Verification(format!(
                "chunk {} size mismatch: expected {}, found {}",
                entry.filename,
                entry.size,
                buf.len()
            )));
        }

        out.write_all(&buf)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(dir: &Path, name: &str, data: &[u8]) -> FileEntry {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        FileEntry {
            absolute: path,
            relative: name.to_string(),
            size: data.len() as u64,
        }
    }

    #[test]
    fn test_chunk_sizes_and_count() {
        let dir = tempdir().unwrap();
        let data = vec![7u8; 250 * 1024 * 1024];
        let file = entry(dir.path(), "a.bin", &data);

        let manifest = Chunker::chunk_file(&file, 100 * 1024 * 1024, true, dir.path()).unwrap();

        assert_eq!(manifest.num_chunks, 3);
        assert_eq!(manifest.chunks[0].size, 100 * 1024 * 1024);
        assert_eq!(manifest.chunks[1].size, 100 * 1024 * 1024);
        assert_eq!(manifest.chunks[2].size, 50 * 1024 * 1024);
        assert_eq!(
            manifest.chunks.iter().map(|c| c.size).sum::<u64>(),
            data.len() as u64
        );
    }

    #[test]
    fn test_round_trip_reassembly() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let file = entry(dir.path(), "a.bin", &data);

        let manifest = Chunker::chunk_file(&file, 4096, true, dir.path()).unwrap();
        let chunk_folder = Chunker::host_folder(&file, true, dir.path());

        let dest = dir.path().join("out.bin");
        reassemble_to(&manifest, &chunk_folder, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_reuse_unchanged_file_keeps_manifest() {
        let dir = tempdir().unwrap();
        let data = vec![3u8; 20_000];
        let file = entry(dir.path(), "a.bin", &data);

        let first = Chunker::chunk_file(&file, 4096, true, dir.path()).unwrap();
        let chunk_folder = Chunker::host_folder(&file, true, dir.path());
        let first_chunk_mtime = fs::metadata(chunk_folder.join("chunk_0000.bin"))
            .unwrap()
            .modified()
            .unwrap();

        let second = Chunker::chunk_file(&file, 4096, true, dir.path()).unwrap();
        let second_chunk_mtime = fs::metadata(chunk_folder.join("chunk_0000.bin"))
            .unwrap()
            .modified()
            .unwrap();

        assert_eq!(first.original_md5, second.original_md5);
        assert_eq!(first.chunks, second.chunks);
        assert_eq!(first_chunk_mtime, second_chunk_mtime);
    }

    #[test]
    fn test_changed_file_triggers_rebuild() {
        let dir = tempdir().unwrap();
        let file = entry(dir.path(), "a.bin", &vec![1u8; 10_000]);
        let first = Chunker::chunk_file(&file, 4096, true, dir.path()).unwrap();

        let new_data = vec![2u8; 12_000];
        fs::write(&file.absolute, &new_data).unwrap();
        let changed_file = FileEntry {
            absolute: file.absolute.clone(),
            relative: file.relative.clone(),
            size: new_data.len() as u64,
        };

        let second = Chunker::chunk_file(&changed_file, 4096, true, dir.path()).unwrap();
        assert_ne!(first.original_md5, second.original_md5);
        assert_eq!(second.original_size, new_data.len() as u64);
    }
}
