/*!
 * Error types for the devgate gateway crate.
 */
use thiserror::Error;

/// Error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Core error
    #[error(transparent)]
    Core(#[from] devgate_core::error::Error),

    /// Malformed YAML file
    #[error("YAML error in {file}: {source}")]
    Yaml {
        file: String,
        #[source]
        source: yaml_rust::ScanError,
    },

    /// Settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error in {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// The underlying core error, if any
    pub fn core(&self) -> Option<&devgate_core::error::Error> {
        match self {
            Self::Core(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devgate_core::error::Error;

    #[test]
    fn test_core_errors_convert() {
        let err: GatewayError = Error::config_invalid("missing subTopic").into();
        assert!(matches!(err.core(), Some(Error::ConfigInvalid(_))));
        assert!(err.to_string().contains("missing subTopic"));
    }
}
