//! Error types for the chunk graph and its optimization passes

use thiserror::Error;

/// Errors surfaced by the chunk graph core.
///
/// Stale records are deliberately absent: a record that no longer matches
/// the build is dropped and answered with an additional seal instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed optimizer options, reported when the pass is constructed
    #[error("Invalid optimization options: {0}")]
    InvalidOptions(String),

    /// No chunk in the module's chunk group ancestry satisfies its placement condition
    #[error("Cannot fulfill chunk condition of {module}")]
    UnsatisfiableChunkCondition { module: String },

    /// A pass kept asking for another seal
    #[error("Chunk graph did not settle after {seals} seals, {pass} keeps requesting another")]
    SealLimitExceeded { seals: usize, pass: String },

    /// A graph description references a module it never declares
    #[error("Unknown module \"{0}\" referenced by the module graph")]
    UnknownModule(String),

    /// Two entries share one name
    #[error("Entry \"{0}\" is declared more than once")]
    DuplicateEntry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
