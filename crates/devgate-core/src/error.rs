/*!
 * Error types for devgate.
 *
 * Lifecycle failures (connect, subscribe, install) are returned to callers;
 * per-reading failures are logged by the drivers and never escape them.
 */
use thiserror::Error;

/// Errors produced by the gateway runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed driver, device or message bus configuration
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Broker or endpoint unreachable
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// A reading could not be represented as the declared value type
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// Unknown device, resource, driver type or message bus type
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config_invalid<S: AsRef<str>>(msg: S) -> Self {
        Self::ConfigInvalid(msg.as_ref().to_string())
    }

    /// Create a new connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        Self::ConnectionFailure(msg.as_ref().to_string())
    }

    /// Create a new unsupported value error
    pub fn unsupported_value<S: AsRef<str>>(msg: S) -> Self {
        Self::UnsupportedValue(msg.as_ref().to_string())
    }

    /// Create a new unknown entity error
    pub fn unknown_entity<S: AsRef<str>>(msg: S) -> Self {
        Self::UnknownEntity(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Self::Timeout(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Self::Other(msg.as_ref().to_string())
    }

    /// True for errors that only affect a single reading
    pub fn is_per_reading(&self) -> bool {
        matches!(self, Self::UnsupportedValue(_) | Self::UnknownEntity(_))
    }
}

/// Result type for devgate operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unsupported_value("300 overflows Uint8");
        assert_eq!(err.to_string(), "unsupported value: 300 overflows Uint8");

        let err = Error::connection("broker down");
        assert_eq!(err.to_string(), "connection failure: broker down");
    }

    #[test]
    fn test_per_reading_classification() {
        assert!(Error::unsupported_value("x").is_per_reading());
        assert!(Error::unknown_entity("x").is_per_reading());
        assert!(!Error::config_invalid("x").is_per_reading());
        assert!(!Error::timeout("x").is_per_reading());
    }

    #[test]
    fn test_from_serde_json() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
