//! Control socket errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A frame arrived that does not decode as a request or response
    #[error("Malformed frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Could not encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Incompatible protocol version: server={server}, client={client}")]
    IncompatibleVersion { server: u32, client: u32 },

    /// The length prefix announced more than the reader accepts
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    /// The daemon answered with an error, or refused the command
    #[error("Daemon error: {0}")]
    ServerError(String),

    /// The peer hung up before a full frame was read
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for the daemon")]
    Timeout,

    #[error("Invalid control socket path: {0}")]
    InvalidSocketPath(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
