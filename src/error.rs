use thiserror::Error;

use crate::PieceIndex;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type of all swarm operations.
///
/// Wire and storage errors kill only the connection they occurred on;
/// configuration errors are fatal at startup.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote's first frame did not carry the expected protocol string.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The message id is not one the protocol defines.
    #[error("invalid message id {0}")]
    InvalidMessageId(u8),

    /// The frame's length prefix or payload does not match its message kind.
    #[error("malformed frame")]
    InvalidFrame,

    /// A piece index that does not exist in the swarm's file.
    #[error("piece index {0} is out of range")]
    InvalidPieceIndex(PieceIndex),

    /// A piece payload whose size does not match the piece's place in the
    /// file.
    #[error("piece {index} has invalid length {len}")]
    InvalidPieceLen { index: PieceIndex, len: usize },

    /// The remote requested a piece we never advertised.
    #[error("piece {0} is not available")]
    PieceNotAvailable(PieceIndex),

    /// The common configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The peer manifest could not be parsed or is missing an entry.
    #[error("invalid peer manifest: {0}")]
    Manifest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
