//! Main Crate Error

use crate::common::PeerRef;
use crate::conduit::FrameError;

#[derive(thiserror::Error, Debug)]
/// Ringdht crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// The connection behind a conduit broke, or the conduit was closed,
    /// while a request was still waiting for its reply.
    #[error("Broken transfer")]
    BrokenTransfer,

    /// Tried to send through a conduit that is already closed.
    #[error("Conduit is closed")]
    ConduitClosed,

    /// A bounded wait on a [crate::conduit::PendingResponse] elapsed.
    #[error("Timed out waiting for a response")]
    Timeout,

    #[error(transparent)]
    /// Invalid frame encoding.
    Frame(#[from] FrameError),

    #[error("Failed to parse payload bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// A ring link that is not in the `hostname:port:id` form.
    #[error("Invalid link: {0:?}")]
    InvalidLink(String),

    /// Indicates that the Id is not 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that a textual Id is not 40 hex characters.
    #[error("Invalid Id: {0:?}")]
    InvalidId(String),

    /// A peer met during a ring walk has no `prev` or `next` link.
    #[error("Broken ring at {0}")]
    BrokenRing(PeerRef),

    /// Ring traversal revisited a peer or ran past the hop limit.
    #[error("Ring traversal did not terminate after {hops} hops")]
    RoutingLoop { hops: usize },

    /// The node has no listener yet, see [crate::Node::start].
    #[error("Node is not started")]
    NotStarted,

    #[error("Node is already started")]
    AlreadyStarted,
}

/// Alias for results of this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
