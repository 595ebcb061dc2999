use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("DNS protocol error: {0}")]
    ProtocolError(String),

    #[error("Hosts file error: {0}")]
    HostsFileError(String),

    #[error("Query timeout waiting on {server}")]
    QueryTimeout { server: String },

    #[error("Transport error with {server}: {reason}")]
    TransportError { server: String, reason: String },

    #[error("All upstream servers are unreachable")]
    AllServersUnreachable,
}
