//! File storage module
//!
//! Local-disk storage backend. A single-file torrent is stored as
//! `<save path>/<name>`, a multi-file torrent under `<save path>/<name>/`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::backend::{StorageBackend, StorageConstructor};
use crate::torrent::TorrentInfo;

/// File storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    /// Torrent information
    torrent_info: Arc<TorrentInfo>,
}

/// A file's place in the torrent's byte stream
#[derive(Debug, Clone)]
struct FileEntry {
    path: PathBuf,
    offset: u64,
    length: u64,
}

impl FileStorage {
    /// Create a new file storage
    pub fn new(base_path: PathBuf, torrent_info: Arc<TorrentInfo>) -> Self {
        debug!(
            "Creating file storage for torrent: {} at {}",
            torrent_info.name,
            base_path.display()
        );
        Self {
            base_path,
            torrent_info,
        }
    }

    /// Constructor the session calls once a transfer's metadata is known
    pub fn constructor() -> StorageConstructor {
        Arc::new(|info, path| Box::new(FileStorage::new(path, info)))
    }

    fn file_path(&self, base: &Path, components: &[String]) -> PathBuf {
        let mut path = base.to_path_buf();
        if self.torrent_info.multi_file {
            path.push(&self.torrent_info.name);
        }
        for component in components {
            path.push(component);
        }
        path
    }

    fn entries_under(&self, base: &Path) -> Vec<FileEntry> {
        self.torrent_info
            .file_offsets()
            .into_iter()
            .zip(&self.torrent_info.files)
            .map(|(offset, file)| FileEntry {
                path: self.file_path(base, &file.path),
                offset,
                length: file.length,
            })
            .collect()
    }

    /// Files overlapping `[offset, offset + length)`, with the overlap in file coordinates
    fn spans(&self, offset: u64, length: u64) -> Vec<(FileEntry, u64, u64)> {
        let end = offset + length;
        self.entries_under(&self.base_path)
            .into_iter()
            .filter(|f| f.length > 0 && f.offset < end && f.offset + f.length > offset)
            .map(|f| {
                let start = offset.max(f.offset) - f.offset;
                let stop = end.min(f.offset + f.length) - f.offset;
                (f, start, stop - start)
            })
            .collect()
    }

    /// Write data at an offset within a piece
    pub async fn write(&self, piece: u32, offset: u32, data: &[u8]) -> Result<()> {
        let absolute = piece as u64 * self.torrent_info.piece_length + offset as u64;
        trace!("Writing {} bytes at offset {}", data.len(), absolute);
        let mut remaining = data;

        for (file, file_offset, len) in self.spans(absolute, data.len() as u64) {
            let mut handle = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.path)
                .await
                .map_err(|e| {
                    error!("Failed to open file '{}': {}", file.path.display(), e);
                    TorrentError::storage_error_full(
                        "Failed to open file for writing",
                        file.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            handle.seek(SeekFrom::Start(file_offset)).await?;
            handle.write_all(&remaining[..len as usize]).await?;
            handle.flush().await?;
            remaining = &remaining[len as usize..];
        }
        Ok(())
    }

    /// Read a whole piece from disk
    pub async fn read_piece(&self, piece: u32) -> Result<Vec<u8>> {
        let (start, end) = self
            .torrent_info
            .piece_range(piece as usize)
            .ok_or_else(|| TorrentError::invalid_argument_with_field("Invalid piece index", "piece_index"))?;
        let mut buffer = Vec::with_capacity((end - start) as usize);

        for (file, file_offset, len) in self.spans(start, end - start) {
            let mut handle = fs::File::open(&file.path).await.map_err(|e| {
                TorrentError::storage_error_full(
                    "Failed to open file for reading",
                    file.path.display().to_string(),
                    e.to_string(),
                )
            })?;
            handle.seek(SeekFrom::Start(file_offset)).await?;
            let mut chunk = vec![0u8; len as usize];
            handle.read_exact(&mut chunk).await?;
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn allocate(&mut self) -> Result<()> {
        info!("Allocating files for torrent: {}", self.torrent_info.name);

        for file in self.entries_under(&self.base_path) {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full(
                        "Failed to create directory",
                        parent.display().to_string(),
                        e.to_string(),
                    )
                })?;
            }
            let handle = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.path)
                .await
                .map_err(|e| {
                    error!("Failed to create file '{}': {}", file.path.display(), e);
                    TorrentError::storage_error_full(
                        "Failed to create file",
                        file.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            // Sparse where the filesystem allows; existing data is kept
            if handle.metadata().await?.len() < file.length {
                handle.set_len(file.length).await?;
            }
        }
        Ok(())
    }

    async fn bytes_present(&self, piece: u32) -> Result<u64> {
        let Some((start, end)) = self.torrent_info.piece_range(piece as usize) else {
            return Ok(0);
        };
        let mut present = 0;
        for (file, file_offset, len) in self.spans(start, end - start) {
            let on_disk = match fs::metadata(&file.path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            present += on_disk.saturating_sub(file_offset).min(len);
        }
        Ok(present)
    }

    async fn verify_hash(&self, piece: u32) -> Result<bool> {
        let expected = self
            .torrent_info
            .piece_hash(piece as usize)
            .ok_or_else(|| TorrentError::invalid_argument_with_field("Invalid piece index", "piece_index"))?;
        let data = self.read_piece(piece).await?;

        let mut hasher = Sha1::new();
        hasher.update(&data);
        let is_valid = hasher.finalize().as_slice() == expected;
        if is_valid {
            trace!("Piece {} verification: PASSED", piece);
        } else {
            debug!("Piece {} verification: FAILED (hash mismatch)", piece);
        }
        Ok(is_valid)
    }

    async fn move_to(&mut self, new_path: &Path) -> Result<()> {
        if new_path == self.base_path {
            return Ok(());
        }
        info!("Moving storage from {} to {}", self.base_path.display(), new_path.display());

        let sources = self.entries_under(&self.base_path);
        let targets = self.entries_under(new_path);
        let mut pairs = Vec::with_capacity(sources.len());
        for (src, dst) in sources.iter().zip(&targets) {
            if !fs::try_exists(&src.path).await? {
                continue;
            }
            let occupied = fs::try_exists(&dst.path).await.map_err(|e| {
                TorrentError::storage_move_failed("could not inspect target", dst.path.display().to_string(), e.to_string())
            })?;
            if occupied {
                warn!("Refusing to move over existing '{}'", dst.path.display());
                return Err(TorrentError::storage_move_failed(
                    "target file already exists",
                    dst.path.display().to_string(),
                    format!("would overwrite {}", dst.path.display()),
                )
                .into());
            }
            pairs.push((src, dst));
        }

        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        for (src, dst) in pairs {
            if let Err(e) = relocate(&src.path, &dst.path).await {
                warn!("Failed to move '{}': {}; rolling back", src.path.display(), e);
                for (from, to) in moved.iter().rev() {
                    if let Err(e) = relocate(to, from).await {
                        error!("Rollback of '{}' failed: {}", to.display(), e);
                    }
                }
                return Err(TorrentError::storage_move_failed(
                    "could not move file",
                    dst.path.display().to_string(),
                    e.to_string(),
                )
                .into());
            }
            moved.push((src.path.clone(), dst.path.clone()));
        }

        self.base_path = new_path.to_path_buf();
        Ok(())
    }

    fn path_of(&self, file: usize) -> Option<PathBuf> {
        self.torrent_info
            .files
            .get(file)
            .map(|f| self.file_path(&self.base_path, &f.path))
    }

    fn save_path(&self) -> &Path {
        &self.base_path
    }
}

// Rename, falling back to copy and delete across filesystems
async fn relocate(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::tests::sample_info;
    use tempfile::TempDir;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Two files (6 + 10 bytes), 8-byte pieces, real piece hashes over `content`
    fn storage(dir: &Path, content: &[u8; 16]) -> FileStorage {
        let mut info = sample_info(8, &[6, 10]);
        info.pieces = content.chunks(8).map(sha1).collect();
        FileStorage::new(dir.to_path_buf(), Arc::new(info))
    }

    #[tokio::test]
    async fn test_allocate_creates_sized_files() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(dir.path(), b"0123456789abcdef");
        storage.allocate().await.unwrap();

        let first = storage.path_of(0).unwrap();
        assert_eq!(first, dir.path().join("sample").join("file0.bin"));
        assert_eq!(std::fs::metadata(&first).unwrap().len(), 6);
        assert_eq!(std::fs::metadata(storage.path_of(1).unwrap()).unwrap().len(), 10);
        assert!(storage.path_of(2).is_none());
    }

    #[tokio::test]
    async fn test_bytes_present() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(dir.path(), b"0123456789abcdef");
        assert_eq!(storage.bytes_present(0).await.unwrap(), 0);

        storage.allocate().await.unwrap();
        assert_eq!(storage.bytes_present(0).await.unwrap(), 8);
        assert_eq!(storage.bytes_present(1).await.unwrap(), 8);
        assert_eq!(storage.bytes_present(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_spanning_files_and_verify() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789abcdef";
        let mut storage = storage(dir.path(), content);
        storage.allocate().await.unwrap();

        assert!(!storage.verify_hash(0).await.unwrap());
        storage.write(0, 0, &content[..8]).await.unwrap();
        assert!(storage.verify_hash(0).await.unwrap());
        assert_eq!(std::fs::read(storage.path_of(0).unwrap()).unwrap(), b"012345");

        storage.write(1, 0, &content[8..]).await.unwrap();
        assert!(storage.verify_hash(1).await.unwrap());
        assert_eq!(storage.read_piece(1).await.unwrap(), b"89abcdef");
    }

    #[tokio::test]
    async fn test_move_to_relocates_every_file() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789abcdef";
        let mut storage = storage(&dir.path().join("old"), content);
        storage.allocate().await.unwrap();
        storage.write(0, 0, &content[..8]).await.unwrap();

        let target = dir.path().join("new");
        storage.move_to(&target).await.unwrap();
        assert_eq!(storage.save_path(), target.as_path());
        assert!(storage.path_of(1).unwrap().exists());
        assert!(!dir.path().join("old").join("sample").join("file0.bin").exists());
        assert!(storage.verify_hash(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_move_refuses_to_overwrite_existing_file() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789abcdef";
        let mut storage = storage(&dir.path().join("old"), content);
        storage.allocate().await.unwrap();
        storage.write(0, 0, &content[..8]).await.unwrap();

        let target = dir.path().join("new");
        let occupied = target.join("sample").join("file1.bin");
        std::fs::create_dir_all(occupied.parent().unwrap()).unwrap();
        std::fs::write(&occupied, b"keep me").unwrap();

        let err = storage.move_to(&target).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::StorageMoveFailed { .. })
        ));
        assert_eq!(std::fs::read(&occupied).unwrap(), b"keep me");
        assert!(!target.join("sample").join("file0.bin").exists());
        assert_eq!(storage.save_path(), dir.path().join("old").as_path());
        assert!(storage.verify_hash(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_move_keeps_original_location() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir.path().join("old"), b"0123456789abcdef");
        storage.allocate().await.unwrap();

        // a plain file where the target directory should be
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();

        let err = storage.move_to(&blocker).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::StorageMoveFailed { .. })
        ));
        assert_eq!(storage.save_path(), dir.path().join("old").as_path());
        assert!(storage.path_of(0).unwrap().exists());
        assert!(storage.path_of(1).unwrap().exists());
    }
}
