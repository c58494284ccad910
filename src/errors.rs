use std::io::Error as IoError;

use serde_json::error::Error as SerializationError;
use thiserror::Error;

/// Consolidates the error types that can occur in the lib.
///
/// Transport and frame level failures (`Connection`, `TlsHandshake`,
/// `MalformedFrame`, `ChannelClosed`) are fatal to the channel that produced
/// them; everything else fails a single call and leaves the channel usable.
#[derive(Debug, Error)]
pub enum Error {
    /// TCP connection to the cast device could not be established.
    #[error("failed to connect to cast device: {0}")]
    Connection(#[source] IoError),
    /// TLS negotiation with the cast device failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[from] rustls::Error),
    /// Frame length prefix or protobuf body could not be parsed. The stream
    /// is considered desynchronized and the channel is closed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// I/O was attempted on a channel that is closed or closing, or the
    /// channel shut down while a caller was waiting for a response.
    #[error("cast channel is closed")]
    ChannelClosed,
    /// No response arrived within the request deadline.
    #[error("request timed out")]
    Timeout,
    /// The caller cancelled the request before a response arrived.
    #[error("request was cancelled")]
    Cancelled,
    /// The receiver rejected an application launch (`LAUNCH_ERROR`).
    #[error("application launch failed: {}", .0.as_deref().unwrap_or("unknown reason"))]
    Launch(Option<String>),
    /// The receiver rejected a media load (`LOAD_FAILED`).
    #[error("media load failed")]
    LoadFailed,
    /// The receiver dropped a media load in favor of a newer one
    /// (`LOAD_CANCELLED`). Carries the cancelled queue item id when the
    /// receiver reports one.
    #[error("media load was cancelled")]
    LoadCancelled(Option<i32>),
    /// The receiver could not make sense of a request (`INVALID_REQUEST`).
    #[error("invalid request: {}", .0.as_deref().unwrap_or("unknown reason"))]
    InvalidRequest(Option<String>),
    /// A facade-level media operation was issued while the receiver reports
    /// no running application.
    #[error("no application is currently running")]
    NoApplicationRunning,
    /// A precondition of the requested operation does not hold.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A response was matched by request id but its discriminator does not
    /// belong to the awaited response family.
    #[error("unexpected response type `{0}`")]
    UnexpectedResponse(String),
    /// Everything related to the network connection once it is established.
    #[error(transparent)]
    Io(#[from] IoError),
    /// (De)serialization failure of an incoming or outgoing JSON payload.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    /// Protobuf layer failure while decoding a frame body.
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

impl Error {
    /// Whether the error ends the channel it was produced on, as opposed to
    /// failing a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::TlsHandshake(_)
                | Error::MalformedFrame(_)
                | Error::ChannelClosed
                | Error::Io(_)
                | Error::Protobuf(_)
        )
    }
}
