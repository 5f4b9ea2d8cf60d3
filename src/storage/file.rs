use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::error::StorageError;
use crate::meta::{FileEntry, TorrentMeta};

pub(crate) async fn ensure_parent_dirs(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// The torrent's ordered files exposed as one contiguous byte sequence.
///
/// Translates `(virtual offset, length)` requests into per-file operations,
/// opening each file as it is reached and carrying the cursor across file
/// boundaries. No file handle outlives a single request.
pub struct FileView {
    save_path: PathBuf,
    meta: Arc<TorrentMeta>,
}

impl FileView {
    pub fn new(save_path: PathBuf, meta: Arc<TorrentMeta>) -> Self {
        Self { save_path, meta }
    }

    fn abs_path(&self, entry: &FileEntry) -> PathBuf {
        self.save_path.join(&entry.path)
    }

    /// Index and in-file offset of the file containing `offset`.
    /// Callers guarantee `offset < total_size`.
    fn locate(&self, offset: u64) -> (usize, u64) {
        let files = self.meta.files();
        let mut idx = 0;
        while idx + 1 < files.len() && offset >= files[idx + 1].offset {
            idx += 1;
        }
        (idx, offset - files[idx].offset)
    }

    /// Fills `buf` from the virtual address space starting at `offset`.
    ///
    /// Returns the number of bytes actually read. Missing or truncated
    /// files end the request early; the unread tail of `buf` is left
    /// untouched, not zero-filled.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if buf.is_empty() || offset >= self.meta.total_size() {
            return Ok(0);
        }

        let files = self.meta.files();
        let (mut idx, mut file_offset) = self.locate(offset);
        let mut filled = 0usize;

        while filled < buf.len() && idx < files.len() {
            let entry = &files[idx];
            let span = ((entry.length - file_offset) as usize).min(buf.len() - filled);

            let mut file = match File::open(self.abs_path(entry)).await {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(filled);
                }
                Err(err) => return Err(err.into()),
            };
            file.seek(SeekFrom::Start(file_offset)).await?;

            let mut got = 0usize;
            while got < span {
                let n = file.read(&mut buf[filled + got..filled + span]).await?;
                if n == 0 {
                    // shorter on disk than declared
                    return Ok(filled + got);
                }
                got += n;
            }

            filled += span;
            idx += 1;
            file_offset = 0;
        }

        Ok(filled)
    }

    /// Writes `data` into the virtual address space starting at `offset`.
    ///
    /// Destination files are created on demand, parent directories first.
    /// Existing files are opened without truncation so bytes outside the
    /// written range are preserved.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        if data.is_empty() {
            return Ok(());
        }

        let files = self.meta.files();
        let (mut idx, mut file_offset) = self.locate(offset);
        let mut written = 0usize;

        while written < data.len() {
            let Some(entry) = files.get(idx) else {
                return Err(StorageError::Io(std::io::Error::other(
                    "write past end of payload",
                )));
            };
            let span = ((entry.length - file_offset) as usize).min(data.len() - written);

            let path = self.abs_path(entry);
            ensure_parent_dirs(&path).await?;
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;
            file.seek(SeekFrom::Start(file_offset)).await?;
            file.write_all(&data[written..written + span]).await?;
            file.flush().await?;

            written += span;
            idx += 1;
            file_offset = 0;
        }

        Ok(())
    }
}
