use thiserror::Error;

/// Failures reported by the transport underneath a relayed connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer ended the connection gracefully.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A read fault that is not a clean close.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("write error: {0}")]
    Write(String),
}

impl TransportError {
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }
}

/// Errors raised while loading `RelayConfig` from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid socket address: {source}")]
    Addr {
        var: &'static str,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("{var} must be a positive integer, got '{value}'")]
    Count { var: &'static str, value: String },

    #[error("{var} must be one of {expected}, got '{value}'")]
    Choice {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{var} must be a single non-empty path segment, got '{value}'")]
    Path { var: &'static str, value: String },
}
