//! Error types for the ElectrumX protocol client.

use thiserror::Error;

use super::messages::RpcError;

/// ElectrumX client errors.
///
/// The variants fall into the classes a caller has to tell apart:
/// transport failures (terminal for the connection), codec failures
/// (one bad frame), protocol errors (the server rejected one request),
/// and the two ways a request can end without an answer: the caller
/// canceled it, or the connection died underneath it.
#[derive(Error, Debug)]
pub enum ElectrumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error, or a result that did not match the
    /// expected type
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame or payload received from the server
    #[error("Codec error: {0}")]
    Codec(String),

    /// Request arguments were neither positional nor named
    #[error("Invalid request params: {0}")]
    InvalidParams(String),

    /// Server returned an error object for a request
    #[error("Server error: {0}")]
    Rpc(RpcError),

    /// Dial failed or the server address was unusable
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// SOCKS proxy negotiation failed
    #[error("Proxy error: {0}")]
    Proxy(#[from] tokio_socks::Error),

    /// Server negotiated a protocol version we do not speak
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Deadline expired (connect, handshake, or write)
    #[error("Timeout")]
    Timeout,

    /// The caller canceled the request before an answer arrived
    #[error("Request canceled")]
    Canceled,

    /// The connection terminated while the request was outstanding
    #[error("Connection terminated")]
    Terminated,

    /// Server has too little data to estimate a fee rate
    #[error("Server cannot estimate a fee rate")]
    CannotEstimateFee,

    /// Address did not parse or belongs to another network
    #[error("Invalid address: {0}")]
    Address(#[from] bitcoin::address::ParseError),

    /// String is not a 32-byte hex scripthash
    #[error("Invalid scripthash: {0}")]
    InvalidScripthash(String),
}

impl ElectrumError {
    /// True if the error ended the connection rather than one request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ElectrumError::Io(_)
                | ElectrumError::ConnectionFailed(_)
                | ElectrumError::Tls(_)
                | ElectrumError::Proxy(_)
                | ElectrumError::Terminated
        )
    }
}

/// Convenient Result type for ElectrumX operations.
pub type ElectrumResult<T> = Result<T, ElectrumError>;
