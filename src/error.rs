use std::io;

/// Custom error type for git_pipeliner operations
#[derive(Debug, thiserror::Error)]
pub enum PipelinerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration error: the HTTP app was not created by this pipeliner, stop it yourself")]
    ExternalServer,

    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Helper type for Results that use PipelinerError
pub type Result<T> = std::result::Result<T, PipelinerError>;
