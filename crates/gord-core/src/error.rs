//! Error types for gord-core

use thiserror::Error;

use crate::channel::ChannelError;

/// Result type alias for gord-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in gord-core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scale key not present in the lookup table
    #[error("Unknown scale: {0}")]
    UnknownScale(String),

    /// Note name or note list that could not be parsed
    #[error("Invalid note: {0}")]
    InvalidNote(String),

    /// Control channel setup error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (scale table) error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
