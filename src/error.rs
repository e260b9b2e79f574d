//! Error types for the cache layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache layer.
///
/// Invalid input (empty keys, keys inside a reserved namespace) is never an
/// error: the facade answers those with a miss or `false`.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// The adapter structurally cannot perform the operation
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The advisory lock stayed held for every retry attempt
    #[error("Lock on '{key}' still held after {attempts} attempts")]
    LockContention { key: String, attempts: u32 },

    /// Generic backend transport failure
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// Redis transport error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Memcached transport error
    #[cfg(feature = "memcached")]
    #[error("Memcached error: {0}")]
    Memcached(#[from] memcache::MemcacheError),

    /// MongoDB transport error
    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed
    #[error("{codec} codec failed: {reason}")]
    Serialization { codec: &'static str, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an unsupported-operation error.
    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Error::Unsupported { backend, operation }
    }

    /// Shorthand for a backend transport error.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Error::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Returns true for the "not implemented by this adapter" kind.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }

    /// Returns true when the error came from the underlying store.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Backend { .. } | Error::Io(_) => true,
            #[cfg(feature = "redis")]
            Error::Redis(_) => true,
            #[cfg(feature = "memcached")]
            Error::Memcached(_) => true,
            #[cfg(feature = "mongodb")]
            Error::Mongo(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            codec: "json",
            reason: e.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization {
            codec: "native",
            reason: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_is_distinct() {
        let err = Error::unsupported("memcached", "keys");
        assert!(err.is_unsupported());
        assert!(!err.is_transport());
        assert_eq!(
            err.to_string(),
            "Operation 'keys' is not supported by the memcached backend"
        );
    }

    #[test]
    fn test_transport_classification() {
        let err = Error::backend("file", "disk gone");
        assert!(err.is_transport());
        assert!(!err.is_unsupported());

        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(io.is_transport());
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse_err = serde_json::from_str::<u32>("not-json").unwrap_err();
        let err = Error::from(parse_err);
        assert!(matches!(err, Error::Serialization { codec: "json", .. }));
    }
}
