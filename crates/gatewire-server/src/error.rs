//! Server error types.

use thiserror::Error;

/// Errors that can occur in the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, bad option combination).
    ///
    /// Fatal: fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error (bind failure, socket option failure,
    /// I/O error).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Protocol error (malformed packet from a peer).
    ///
    /// Fatal for that connection; the server keeps serving others.
    #[error("protocol error: {0}")]
    Protocol(#[from] gatewire_proto::ProtocolError),

    /// Unexpected internal state. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_to_transport() {
        let err: ServerError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy").into();
        assert!(matches!(err, ServerError::Transport(_)));
        assert!(err.to_string().contains("port busy"));
    }
}
