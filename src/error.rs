use thiserror::Error as ThisError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, ThisError, PartialEq, Clone)]
pub enum Error {
    #[error("key not present in tree")]
    NotFound,

    #[error("value not present for given key: {0}")]
    ValueMismatch(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("decoding failure: {0}")]
    Decoding(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Decoding(format!("json error: {}", error))
    }
}
