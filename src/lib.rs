// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

mod choker;
pub mod conf;
pub mod engine;
pub mod error;
mod peer;
mod session;
mod storage;

use bitvec::prelude::{BitVec, Msb0};

/// Each peer in the swarm is identified by the 32-bit id assigned to it in
/// the peer manifest.
pub type PeerId = u32;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that pieces 0, 1, and 7 are present). A truthy boolean value of
/// a piece's position in this vector means that the peer has the piece, while
/// a falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// Returns the number of pieces a file of the given length is split into.
///
/// The file is cut into `piece_len` sized chunks, so the last piece may be
/// shorter and the count needs to round up.
pub(crate) fn piece_count(file_len: u64, piece_len: u32) -> usize {
    ((file_len + piece_len as u64 - 1) / piece_len as u64) as usize
}
