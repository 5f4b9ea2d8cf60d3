use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPiece(usize),

    #[error("invalid slot index: {0}")]
    InvalidSlot(usize),

    #[error("invalid range for slot {slot}: offset {offset}, len {len}")]
    InvalidRange { slot: usize, offset: u64, len: u64 },

    #[error("piece {0} is not on disk")]
    PieceNotOnDisk(usize),

    #[error("no usable free slot for piece {0}")]
    NoFreeSlot(usize),
}
