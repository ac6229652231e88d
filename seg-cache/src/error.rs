//! Error types for the segment cache engine

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("item of {size} bytes exceeds the segment capacity of {max} bytes")]
    Oversized { size: usize, max: usize },

    #[error("no segment could be freed for a new reservation")]
    OutOfMemory,

    #[error("value is not an unsigned integer")]
    NotANumber,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SegError>;
