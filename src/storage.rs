//! Piece-to-slot disk storage.
//!
//! This module maps the fixed-size logical pieces of a torrent onto
//! physical slots inside the multi-file payload on disk, verifies existing
//! content against the expected piece hashes when resuming, materializes
//! slot backing on demand, and serves per-piece random-access reads and
//! writes concurrently.
//!
//! # Overview
//!
//! The payload's files, concatenated in declaration order, form one byte
//! address space. Slot `i` is the piece-sized window starting at
//! `i * piece_length`; the last slot is shorter. A piece does not have to
//! live at the slot matching its index: the resume check takes content
//! wherever it finds it, and writes prefer but do not require the natural
//! slot, relocating a displaced piece when they claim it.
//!
//! # Components
//!
//! - [`PieceManager`] - piece↔slot mapping, resume check, lazy allocation
//! - [`SlotStore`] - per-slot mutual exclusion and range translation
//! - [`FileView`] - the file list as one contiguous byte sequence
//! - [`CheckProgress`] - progress fraction and cancellation for a check
//!
//! # Example
//!
//! ```no_run
//! use piecestore::{CheckProgress, PieceManager, TorrentMeta};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let meta = Arc::new(TorrentMeta::new(
//!     16_384,
//!     vec![[0u8; 20]; 3],
//!     vec![
//!         (PathBuf::from("album/track1.flac"), 30_000),
//!         (PathBuf::from("album/track2.flac"), 10_000),
//!     ],
//! )?);
//!
//! let manager = PieceManager::new(meta, "./downloads");
//!
//! // Classify whatever is already on disk.
//! let progress = CheckProgress::new();
//! let have = manager.check_pieces(&progress).await?;
//! println!("{}/{} pieces on disk", have.count(), have.piece_count());
//!
//! // Serve piece traffic.
//! manager.write(0, 0, &vec![1u8; 16_384]).await?;
//! let data = manager.read(0, 0, 16_384).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod file;
mod hasher;
mod manager;
mod slot;

pub use error::StorageError;
pub use file::FileView;
pub use manager::{CheckProgress, PieceManager};
pub use slot::SlotStore;
