use thiserror::Error;

/// Errors surfaced by the peer I/O layer.
///
/// Runtime failures on an established connection (timeout, EOF, socket
/// errors) are not returned as `Result`s; they reach the consumer through
/// the error callback with reason bits attached.
#[derive(Debug, Error)]
pub enum PeerIoError {
    /// The outbound TCP connection could not be opened.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// The connection has already been closed.
    #[error("connection closed")]
    Closed,
}
