use std::io;

use thiserror::Error;

/// Session-level failures. Transport and bind variants are fatal to the
/// operation that raised them; the rest flag transitions taken from the
/// wrong connection state.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("transport initialization failed: {0}")]
    TransportInit(#[from] io::Error),
    #[error("failed to bind server on {addr}: {source}")]
    ServerBind { addr: String, source: io::Error },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("client is already active, stop it before connecting again")]
    ClientAlreadyActive,
    #[error("client is still mid-handshake and cannot be stopped")]
    ClientNotConnected,
    #[error("server is not running")]
    ServerNotRunning,
}
