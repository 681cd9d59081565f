//! Error types for herd.

use thiserror::Error;

/// Main error type for the cluster supervisor.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn worker {id}: {source}")]
    Spawn {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid listen address '{0}'. Expected 'host:port' or ':port'.")]
    InvalidListenAddress(String),

    #[error("Invalid worker id '{0}' in WORKER_ID")]
    InvalidWorkerId(String),

    #[error("Internal port for worker {id} is out of range (base port {base_port})")]
    PortOutOfRange { base_port: u16, id: u32 },

    #[error("Proxy distribution needs a fixed listen port, got {0}; worker ports are derived from it")]
    ProxyNeedsFixedPort(std::net::SocketAddr),

    #[error("Shared port binding (SO_REUSEPORT) is not supported on this platform")]
    SharedBindUnsupported,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy server error: {0}")]
    ProxyServer(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for herd operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_invalid_listen_address_message() {
        let err = ClusterError::InvalidListenAddress("nope".to_string());
        let msg = err.to_string();
        assert!(msg.contains("nope"));
        assert!(msg.contains(":port"));
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        let err = ClusterError::Spawn {
            id: 3,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("worker 3"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("denied"));
    }

    #[test]
    fn test_port_out_of_range_message() {
        let err = ClusterError::PortOutOfRange {
            base_port: 65500,
            id: 40,
        };
        let msg = err.to_string();
        assert!(msg.contains("65500"));
        assert!(msg.contains("worker 40"));
    }

    #[test]
    fn test_bind_error_message() {
        let err = ClusterError::Bind {
            addr: "0.0.0.0:80".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:80"));
        assert!(msg.contains("in use"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ClusterError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<()> {
            Err(ClusterError::SharedBindUnsupported)
        }
        assert!(returns_err().is_err());
    }
}
