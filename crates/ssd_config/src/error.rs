//! Result and Error types for the crate.
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result containing an error variant from this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration error variants
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The config file could not be read.
    #[error("Failed to read config file `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML.
    #[error("Failed to parse config file `{path}`")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The (merged) table does not match the config struct, this wraps a [toml::de::Error]
    #[error("Failed to deserialize config")]
    Deserialize(#[source] toml::de::Error),
}
