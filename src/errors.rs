// src/errors.rs

//! Crate-wide error type and `Result` alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("core reservation failed: {0}")]
    Reservation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("descriptor error: {0}")]
    Descriptor(String),

    #[error("build cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
