use thiserror::Error;

/// Error type for all host-networking operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Netlink operation failed
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),
    /// System I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// External command execution failed
    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },
    /// Input validation failed
    #[error("validation error: {0}")]
    Validation(String),
    /// Resource not found (link, address, route)
    #[error("not found: {0}")]
    NotFound(String),
    /// No iptables backend binary answered the probe
    #[error("could not find a working iptables backend")]
    NoIptablesBackend,
}

pub type NetworkResult<T> = Result<T, NetworkError>;
