use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use super::error::StorageError;
use super::file::FileView;
use crate::meta::TorrentMeta;

/// Mutually exclusive slot access over the file view.
///
/// A slot is a piece-sized container in the concatenated payload: slot `i`
/// covers bytes `[i * piece_length, i * piece_length + piece_size(i))`.
/// One mutex per slot serializes requests for that slot while requests for
/// different slots run in parallel; the guard is held across the file I/O
/// and released on every exit path.
pub struct SlotStore {
    meta: Arc<TorrentMeta>,
    view: FileView,
    locks: Vec<Mutex<()>>,
}

impl SlotStore {
    pub fn new(save_path: PathBuf, meta: Arc<TorrentMeta>) -> Self {
        let locks = (0..meta.num_pieces()).map(|_| Mutex::new(())).collect();
        Self {
            view: FileView::new(save_path, meta.clone()),
            meta,
            locks,
        }
    }

    /// Validates the request and clamps it to the slot. The last slot is
    /// shorter than the rest.
    fn checked_span(&self, slot: usize, offset: u64, len: u64) -> Result<u64, StorageError> {
        if slot >= self.meta.num_pieces() {
            return Err(StorageError::InvalidSlot(slot));
        }
        let slot_size = self.meta.piece_size(slot);
        if len == 0 || offset >= slot_size {
            return Err(StorageError::InvalidRange { slot, offset, len });
        }
        Ok(len.min(slot_size - offset))
    }

    /// Reads up to `len` bytes from the slot. Returns fewer bytes when the
    /// backing files are missing or shorter than declared.
    pub async fn read(&self, slot: usize, offset: u64, len: u64) -> Result<Bytes, StorageError> {
        let span = self.checked_span(slot, offset, len)?;
        let _guard = self.locks[slot].lock().await;

        let start = slot as u64 * self.meta.piece_length() + offset;
        let mut buf = vec![0u8; span as usize];
        let n = self.view.read_at(start, &mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Writes `data` into the slot, clamped to the slot's size.
    pub async fn write(&self, slot: usize, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let span = self.checked_span(slot, offset, data.len() as u64)?;
        let _guard = self.locks[slot].lock().await;

        let start = slot as u64 * self.meta.piece_length() + offset;
        self.view.write_at(start, &data[..span as usize]).await
    }
}
