use thiserror::Error;

/// Errors raised while framing or parsing relay messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty frame")]
    EmptyFrame,

    #[error("invalid verb {0:?}: expected a single character")]
    InvalidVerb(String),

    #[error("connect payload is missing the {0} field")]
    MissingField(&'static str),

    #[error("invalid protocol version {0:?}")]
    InvalidVersion(String),

    #[error("connect payload has {0} fields, expected at most 4")]
    TooManyFields(usize),

    #[error("frame exceeds {max} bytes without a delimiter")]
    FrameTooLong { max: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
