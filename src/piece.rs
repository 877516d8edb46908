//! # Piece Work Items
//!
//! Pieces are the unit of distribution and verification. The coordinator
//! seeds one [`PieceWork`] per piece into the shared work queue; sessions
//! drain the queue, download and verify a piece, and hand back a
//! [`PieceResult`] carrying the assembled bytes.

/// One piece waiting to be downloaded.
///
/// Immutable once created. The download buffer and progress counters live in
/// the session working on the piece, so a work item can be requeued untouched
/// when a peer fails to serve it.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of the piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece
    pub hash: [u8; 20],
    /// Length of the piece in bytes (the last piece may be short)
    pub length: u32,
}

/// A downloaded piece that passed its integrity check.
#[derive(Debug)]
pub struct PieceResult {
    /// Zero-based index of the piece in the torrent
    pub index: u32,
    /// Verified piece data, exactly `length` bytes of the work item
    pub data: Vec<u8>,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceResult {
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}
