use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TncError {
    #[error("Buffer arena exhausted")]
    ArenaExhausted,

    #[error("Frame is shared and cannot be written")]
    ReadOnly,

    #[error("Read past end of frame")]
    Eof,

    #[error("Offset {offset} outside frame of length {length}")]
    InvalidOffset { offset: usize, length: usize },

    #[error("Frames belong to different arenas")]
    ArenaMismatch,

    #[error("Frame queue closed")]
    QueueClosed,

    #[error("Operation timeout")]
    Timeout,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Repeater path longer than 7 addresses")]
    PathTooLong,

    #[error("Frame too short for an address header")]
    FrameTooShort,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TncError>;
