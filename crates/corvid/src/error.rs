//! Crate-level error type.
//!
//! Component errors stay typed in their modules; this enum is what the
//! [`Conversation`](crate::agent::Conversation) facade and the binary
//! return. Tool failures never reach it: the loop records them.

use crate::agent::LoopError;
use crate::api::ApiError;
use crate::config::ConfigError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The provider error behind this failure, if any.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api(e) => Some(e),
            Error::Loop(e) => Some(&e.source),
            _ => None,
        }
    }
}
