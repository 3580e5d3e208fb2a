use std::{io, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("failed to listen for peers on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("failed to connect to rendezvous at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("rank {rank} is outside a world of size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("rank {0} joined the group twice")]
    DuplicateRank(usize),

    #[error("rank {rank} expects a world of {got} processes but rank 0 expects {expected}")]
    WorldSizeMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },

    #[error("rendezvous rejected this process: {0}")]
    Rejected(String),

    #[error("unexpected rendezvous message: {0}")]
    Protocol(String),

    #[error("peer closed the connection")]
    Closed,

    #[error("malformed rendezvous frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("no accelerator with index {0} on this host")]
    NoDevice(usize),

    #[error("backend {0} is not available in this build")]
    BackendUnavailable(&'static str),

    #[error("NCCL: {0}")]
    Nccl(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
