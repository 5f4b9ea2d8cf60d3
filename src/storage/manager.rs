use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::error::StorageError;
use super::file::ensure_parent_dirs;
use super::hasher::LazyHasher;
use super::slot::SlotStore;
use crate::bitfield::Bitfield;
use crate::meta::TorrentMeta;

/// How many slots a lazy allocation materializes at a time.
const DEFAULT_ALLOCATION_CHUNK: usize = 5;

/// Where a slot stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// No backing storage has been written for this slot yet.
    Unallocated,
    /// Backing storage exists but no piece is assigned here.
    Free,
    /// The slot holds this piece.
    Piece(usize),
}

/// Shared progress and cancellation for a resume check.
///
/// The check updates the fraction and polls for cancellation as it scans;
/// both live behind one mutex that is only ever held for O(1).
#[derive(Debug, Default)]
pub struct CheckProgress {
    inner: SyncMutex<ProgressInner>,
}

#[derive(Debug, Default)]
struct ProgressInner {
    fraction: f32,
    cancelled: bool,
}

impl CheckProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of slots scanned so far, in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        self.inner.lock().fraction
    }

    /// Asks a running check to stop. The check polls this as it scans and
    /// returns early with whatever it has classified so far.
    pub fn cancel(&self) {
        self.inner.lock().cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Publishes a new fraction and reports whether the check should stop.
    fn update(&self, fraction: f32) -> bool {
        let mut inner = self.inner.lock();
        inner.fraction = fraction;
        inner.cancelled
    }
}

/// The piece <-> slot mapping tables. All four structures are mutated
/// together under the manager's state lock; `free_slots`,
/// `unallocated_slots` and the assigned slots partition `[0, N)`.
struct Tables {
    piece_to_slot: Vec<Option<usize>>,
    slot_to_piece: Vec<SlotState>,
    free_slots: Vec<usize>,
    unallocated_slots: VecDeque<usize>,
    have: Bitfield,
    bytes_left: u64,
}

impl Tables {
    fn new(meta: &TorrentMeta) -> Self {
        let n = meta.num_pieces();
        Self {
            piece_to_slot: vec![None; n],
            slot_to_piece: vec![SlotState::Unallocated; n],
            free_slots: Vec::new(),
            unallocated_slots: (0..n).collect(),
            have: Bitfield::new(n),
            bytes_left: meta.total_size(),
        }
    }
}

/// Maps logical pieces onto physical slots and serves per-piece I/O.
///
/// Construction performs no I/O: every slot starts unallocated, so a fresh
/// torrent can be written immediately. [`check_pieces`] rebuilds the tables
/// from whatever already exists on disk; [`write`] lazily materializes slot
/// backing through [`allocate_slots`] as needed.
///
/// [`check_pieces`]: PieceManager::check_pieces
/// [`write`]: PieceManager::write
/// [`allocate_slots`]: PieceManager::allocate_slots
pub struct PieceManager {
    meta: Arc<TorrentMeta>,
    save_path: PathBuf,
    store: SlotStore,
    tables: Mutex<Tables>,
    /// Serializes allocation campaigns. Taken before the tables lock.
    alloc_gate: Mutex<()>,
    allocation_chunk: usize,
}

impl PieceManager {
    pub fn new(meta: Arc<TorrentMeta>, save_path: impl Into<PathBuf>) -> Self {
        let save_path = save_path.into();
        Self {
            store: SlotStore::new(save_path.clone(), meta.clone()),
            tables: Mutex::new(Tables::new(&meta)),
            alloc_gate: Mutex::new(()),
            allocation_chunk: DEFAULT_ALLOCATION_CHUNK,
            meta,
            save_path,
        }
    }

    /// Overrides how many slots each implicit allocation materializes.
    pub fn with_allocation_chunk(mut self, chunk: usize) -> Self {
        self.allocation_chunk = chunk.max(1);
        self
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// The set of pieces verified present by the last check.
    pub async fn have_pieces(&self) -> Bitfield {
        self.tables.lock().await.have.clone()
    }

    /// Bytes not yet verified present.
    pub async fn bytes_left(&self) -> u64 {
        self.tables.lock().await.bytes_left
    }

    /// Reads up to `len` bytes of a piece that is on disk.
    ///
    /// The piece must have been verified by a check or written; reading an
    /// absent piece is a caller error. Returns fewer bytes than requested
    /// when the backing files are shorter than declared.
    pub async fn read(
        &self,
        piece_index: usize,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, StorageError> {
        let slot = {
            let tables = self.tables.lock().await;
            match tables.piece_to_slot.get(piece_index) {
                None => return Err(StorageError::InvalidPiece(piece_index)),
                Some(None) => return Err(StorageError::PieceNotOnDisk(piece_index)),
                Some(Some(slot)) => *slot,
            }
        };
        self.store.read(slot, offset, len).await
    }

    /// Writes `data` into a piece, assigning and materializing a slot for
    /// it if it has none yet.
    pub async fn write(
        &self,
        piece_index: usize,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let (slot, fresh) = self.slot_for_piece(piece_index).await?;
        match self.store.write(slot, offset, data).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if fresh {
                    // undo the assignment so a retry can pick the slot again
                    let mut tables = self.tables.lock().await;
                    if tables.piece_to_slot[piece_index] == Some(slot) {
                        tables.piece_to_slot[piece_index] = None;
                        tables.slot_to_piece[slot] = SlotState::Free;
                        tables.free_slots.push(slot);
                    }
                }
                Err(err)
            }
        }
    }

    /// Returns the slot holding `piece_index`, assigning one if necessary,
    /// plus whether the assignment was made by this call.
    async fn slot_for_piece(&self, piece_index: usize) -> Result<(usize, bool), StorageError> {
        let num_pieces = self.meta.num_pieces();
        if piece_index >= num_pieces {
            return Err(StorageError::InvalidPiece(piece_index));
        }

        let mut tables = self.tables.lock().await;
        debug_assert_tables(&tables, &self.meta);

        if let Some(slot) = tables.piece_to_slot[piece_index] {
            return Ok((slot, false));
        }

        if tables.free_slots.is_empty() {
            self.allocate_locked(&mut tables, self.allocation_chunk).await?;
            if tables.free_slots.is_empty() {
                return Err(StorageError::NoFreeSlot(piece_index));
            }
        }

        let short_slot = num_pieces - 1;
        let chosen = match tables.free_slots.iter().position(|&s| s == piece_index) {
            // The piece's own slot is free: take it and keep locality.
            Some(at) => tables.free_slots.remove(at),
            None => {
                let mut at = tables.free_slots.len() - 1;
                // The last slot is short; never hand it to another piece.
                if tables.free_slots[at] == short_slot && piece_index != short_slot {
                    if tables.free_slots.len() == 1 {
                        self.allocate_locked(&mut tables, self.allocation_chunk).await?;
                        // freshly allocated slots land at the tail
                        at = tables.free_slots.len() - 1;
                    }
                    if tables.free_slots[at] == short_slot {
                        if at == 0 {
                            return Err(StorageError::NoFreeSlot(piece_index));
                        }
                        at -= 1;
                    }
                }
                tables.free_slots.remove(at)
            }
        };

        debug_assert_eq!(tables.slot_to_piece[chosen], SlotState::Free);
        tables.slot_to_piece[chosen] = SlotState::Piece(piece_index);
        tables.piece_to_slot[piece_index] = Some(chosen);

        // Another piece occupies this piece's natural slot: move it into the
        // slot we were handed so the caller's piece lands at its own index.
        if chosen != piece_index {
            if let SlotState::Piece(displaced) = tables.slot_to_piece[piece_index] {
                trace!(
                    piece = piece_index,
                    chosen,
                    displaced,
                    "slot collision, relocating occupant"
                );
                trace_tables(&tables);

                let content = self
                    .store
                    .read(piece_index, 0, self.meta.piece_length())
                    .await?;
                self.store.write(chosen, 0, &content).await?;

                tables.slot_to_piece.swap(piece_index, chosen);
                tables.piece_to_slot.swap(piece_index, displaced);

                trace_tables(&tables);
                debug_assert_tables(&tables, &self.meta);
                return Ok((piece_index, true));
            }
        }

        debug_assert_tables(&tables, &self.meta);
        Ok((chosen, true))
    }

    /// Materializes backing storage for up to `n` unallocated slots and
    /// returns how many gained backing.
    ///
    /// Only one campaign runs at a time; concurrent callers wait their
    /// turn. Also runs implicitly from [`write`](PieceManager::write) when
    /// the free pool is empty.
    pub async fn allocate_slots(&self, n: usize) -> Result<usize, StorageError> {
        let _campaign = self.alloc_gate.lock().await;
        let mut tables = self.tables.lock().await;
        self.allocate_locked(&mut tables, n).await
    }

    async fn allocate_locked(
        &self,
        tables: &mut Tables,
        n: usize,
    ) -> Result<usize, StorageError> {
        debug_assert_tables(tables, &self.meta);
        debug!(
            requested = n,
            unallocated = tables.unallocated_slots.len(),
            "allocating slots"
        );

        let zeros = vec![0u8; self.meta.piece_length() as usize];
        let mut done = 0;

        for _ in 0..n {
            let Some(pos) = tables.unallocated_slots.pop_front() else {
                break;
            };

            // If piece `pos` already lives at some other slot, rebind it to
            // its natural slot and free the slot it came from.
            let freed = match tables.piece_to_slot[pos] {
                Some(other) => {
                    tables.slot_to_piece[pos] = SlotState::Piece(pos);
                    tables.piece_to_slot[pos] = Some(pos);
                    other
                }
                None => pos,
            };
            tables.slot_to_piece[freed] = SlotState::Free;
            tables.free_slots.push(freed);

            let fill = self.meta.piece_size(pos) as usize;
            self.store.write(pos, 0, &zeros[..fill]).await?;
            done += 1;
        }

        debug_assert_tables(tables, &self.meta);
        Ok(done)
    }

    /// Scans the payload left to right, slot by slot, and classifies every
    /// slot against the expected piece hashes, rebuilding the mapping
    /// tables from whatever is already on disk.
    ///
    /// Returns the have-piece set. A cancelled check returns early with
    /// the tables populated for the slots scanned so far.
    pub async fn check_pieces(&self, progress: &CheckProgress) -> Result<Bitfield, StorageError> {
        let mut tables = self.tables.lock().await;
        *tables = Tables::new(&self.meta);
        // the scan classifies every slot it reaches itself
        tables.unallocated_slots.clear();

        let num_pieces = self.meta.num_pieces();
        let piece_length = self.meta.piece_length();
        let last_piece = num_pieces - 1;
        let last_piece_size = self.meta.piece_size(last_piece) as usize;
        let files = self.meta.files();

        let mut buffer = vec![0u8; piece_length as usize];
        // fill position within `buffer`
        let mut piece_offset = 0usize;
        let mut current_slot = 0usize;
        // bytes still missing from the current piece
        let mut bytes_to_read = self.meta.piece_size(0);
        // bytes consumed from the current file, counting the skipped prefix
        let mut bytes_current_read = 0u64;
        // where the first read of the next file starts
        let mut seek_into_next = 0u64;
        // virtual offset of the current piece
        let mut start_of_read = 0u64;
        // virtual offset of the current file
        let mut start_of_file = 0u64;
        let mut changed_file = true;
        let mut file: Option<File> = None;
        let mut file_size = 0u64;

        debug!(pieces = num_pieces, files = files.len(), "resume check started");

        let mut file_idx = 0;
        while file_idx < files.len() {
            if progress.update(current_slot as f32 / num_pieces as f32) {
                debug!(slot = current_slot, "resume check cancelled");
                return Ok(tables.have.clone());
            }

            let entry = &files[file_idx];
            let path = self.save_path.join(&entry.path);

            if changed_file {
                ensure_parent_dirs(&path).await?;
                changed_file = false;
                bytes_current_read = seek_into_next;

                file = match File::open(&path).await {
                    Ok(mut opened) => {
                        file_size = opened.metadata().await?.len();
                        opened.seek(SeekFrom::Start(seek_into_next)).await?;
                        Some(opened)
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        file_size = 0;
                        None
                    }
                    Err(err) => return Err(err.into()),
                };
            }

            // at the start of a new piece, remember where it begins
            if bytes_to_read == self.meta.piece_size(current_slot) {
                start_of_read = current_slot as u64 * piece_length;
            }

            let mut bytes_read = 0usize;
            if file_size > 0 {
                if let Some(opened) = file.as_mut() {
                    let want = bytes_to_read as usize;
                    while bytes_read < want {
                        let n = opened
                            .read(&mut buffer[piece_offset + bytes_read..piece_offset + want])
                            .await?;
                        if n == 0 {
                            break;
                        }
                        bytes_read += n;
                    }
                }
            }

            bytes_current_read += bytes_read as u64;
            bytes_to_read -= bytes_read as u64;

            if bytes_to_read > 0 {
                // the current file ran out mid-piece
                if bytes_current_read != entry.length {
                    // the file is missing or shorter than declared: every
                    // slot inside the missing tail has no backing
                    let file_end = start_of_file + entry.length;
                    let mut pos = start_of_read;
                    while pos < file_end {
                        trace!(slot = current_slot, "slot unallocated");
                        tables.unallocated_slots.push_back(current_slot);
                        current_slot += 1;
                        pos += piece_length;
                    }
                    seek_into_next = pos - file_end;
                    bytes_to_read = self.meta.piece_size(current_slot);
                    piece_offset = 0;
                } else {
                    seek_into_next = 0;
                    piece_offset += bytes_read;
                }

                changed_file = true;
                start_of_file += entry.length;
                file_idx += 1;
                continue;
            }

            // A full piece buffer is assembled. The final piece is shorter
            // than the rest, so two candidate digests are in play; each is
            // computed at most once no matter how many hashes it is
            // compared against.
            let mut full_digest = LazyHasher::new(&buffer, piece_length as usize);
            let mut short_digest = LazyHasher::new(&buffer, last_piece_size);

            let mut found = None;
            for i in 0..num_pieces {
                // the current slot is retried even when its piece was
                // already seen: the slot at the scan position wins
                if tables.have.has_piece(i) && i != current_slot {
                    continue;
                }
                let digest = if i == last_piece {
                    short_digest.get()
                } else {
                    full_digest.get()
                };
                if &digest == self.meta.hash_for_piece(i) {
                    found = Some(i);
                    break;
                }
            }

            match found {
                Some(piece) => {
                    if tables.have.has_piece(piece) {
                        if let Some(previous) = tables.piece_to_slot[piece] {
                            trace!(piece, previous, slot = current_slot, "piece re-found, demoting earlier slot");
                            tables.slot_to_piece[previous] = SlotState::Free;
                            tables.free_slots.push(previous);
                        }
                    } else {
                        tables.bytes_left -= self.meta.piece_size(piece);
                        tables.have.set_piece(piece);
                    }
                    tables.piece_to_slot[piece] = Some(current_slot);
                    tables.slot_to_piece[current_slot] = SlotState::Piece(piece);
                }
                None => {
                    tables.slot_to_piece[current_slot] = SlotState::Free;
                    tables.free_slots.push(current_slot);
                }
            }

            piece_offset = 0;
            current_slot += 1;
            if current_slot == num_pieces {
                break;
            }
            bytes_to_read = self.meta.piece_size(current_slot);
        }

        debug!(
            have = tables.have.count(),
            free = tables.free_slots.len(),
            unallocated = tables.unallocated_slots.len(),
            pieces = num_pieces,
            "resume check complete"
        );
        debug_assert_tables(&tables, &self.meta);
        progress.update(1.0);
        Ok(tables.have.clone())
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> TablesSnapshot {
        let tables = self.tables.lock().await;
        TablesSnapshot {
            piece_to_slot: tables.piece_to_slot.clone(),
            slot_to_piece: tables.slot_to_piece.clone(),
            free_slots: tables.free_slots.clone(),
            unallocated_slots: tables.unallocated_slots.iter().copied().collect(),
            have: tables.have.clone(),
            bytes_left: tables.bytes_left,
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct TablesSnapshot {
    pub piece_to_slot: Vec<Option<usize>>,
    pub slot_to_piece: Vec<SlotState>,
    pub free_slots: Vec<usize>,
    pub unallocated_slots: Vec<usize>,
    pub have: Bitfield,
    pub bytes_left: u64,
}

/// Audits the mapping invariants. Debug builds only.
fn debug_assert_tables(tables: &Tables, meta: &TorrentMeta) {
    if !cfg!(debug_assertions) {
        return;
    }

    let n = meta.num_pieces();
    debug_assert_eq!(tables.piece_to_slot.len(), n);
    debug_assert_eq!(tables.slot_to_piece.len(), n);

    for &slot in &tables.free_slots {
        debug_assert_eq!(tables.slot_to_piece[slot], SlotState::Free);
    }
    for &slot in &tables.unallocated_slots {
        debug_assert_eq!(tables.slot_to_piece[slot], SlotState::Unallocated);
    }
    for (slot, state) in tables.slot_to_piece.iter().enumerate() {
        if let SlotState::Piece(piece) = state {
            debug_assert_eq!(tables.piece_to_slot[*piece], Some(slot));
        }
    }
    for (piece, assigned) in tables.piece_to_slot.iter().enumerate() {
        if let Some(slot) = assigned {
            debug_assert_eq!(tables.slot_to_piece[*slot], SlotState::Piece(piece));
        }
    }
}

/// Dumps the slot table at trace level, one line per slot.
fn trace_tables(tables: &Tables) {
    for (slot, state) in tables.slot_to_piece.iter().enumerate() {
        trace!(slot, state = ?state, assigned = ?tables.piece_to_slot[slot], "mapping");
    }
}
