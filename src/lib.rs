//! piecestore - a piece-to-slot disk storage engine for BitTorrent clients
//!
//! This library implements the storage half of a torrent client: given a
//! torrent's metadata, it lays the payload out across its files on disk,
//! classifies whatever already exists when a download resumes, and serves
//! concurrent per-piece reads and writes while backing storage is
//! materialized lazily.
//!
//! # Modules
//!
//! - [`meta`] - Torrent metadata consumed by the engine
//! - [`storage`] - Piece↔slot mapping, resume check, disk I/O
//! - [`bitfield`] - Piece presence tracking

pub mod bitfield;
pub mod meta;
pub mod storage;

pub use bitfield::Bitfield;
pub use meta::{FileEntry, MetaError, TorrentMeta};
pub use storage::{CheckProgress, FileView, PieceManager, SlotStore, StorageError};
