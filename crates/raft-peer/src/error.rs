//! # error
//!
//! why: one error type for everything a running peer can fail at
//! relations: returned by Raft::new and the rpc handlers in peer.rs
//! what: PeerError, PeerResult

use raft_core::CoreError;
use thiserror::Error;

pub type PeerResult<T> = std::result::Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    /// The persister refused a write or returned unreadable data
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// The peer was killed; it answers nothing
    #[error("peer has been killed")]
    Killed,
}
