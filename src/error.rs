use std::io;

use crate::chain::Role;

pub type Result<T> = std::result::Result<T, ChainError>;

/// Failures of the chain engine itself.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("chain has no hops")]
    EmptyChain,

    #[error("hop index {index} out of range for chain of {len} hops")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("hop {index} carries no {expected} payload")]
    PayloadMismatch { index: usize, expected: &'static str },

    #[error("chain has no {0} hop")]
    MissingHop(Role),

    #[error("transport {0}")]
    Transport(String),

    #[error("remote server returned failure")]
    Rejected,
}

impl From<io::Error> for ChainError {
    fn from(err: io::Error) -> Self {
        ChainError::Transport(err.to_string())
    }
}

impl From<tarpc::client::RpcError> for ChainError {
    fn from(err: tarpc::client::RpcError) -> Self {
        ChainError::Transport(err.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("no active {0} node")]
    NoActiveNode(Role),

    #[error("{0} nodes do not register with the frontend")]
    NotRegistrable(Role),
}

/// Errors surfaced to whoever drives the client.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("io {0}")]
    Io(#[from] io::Error),

    #[error("file name is empty")]
    EmptyName,

    #[error("{0:?} is not a plain file name")]
    InvalidName(String),

    #[error("files cannot be empty")]
    EmptyContent,

    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("system chain disrupted")]
    Disrupted,

    #[error("invalid secret provided")]
    AuthInvalid,

    #[error("no reply for chain {0}")]
    NoReply(String),

    #[error("chain {0}")]
    Chain(#[from] ChainError),
}
