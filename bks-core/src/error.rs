/// BKS Error Types
///
/// Errors shared by the transport, negotiation and session layers.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for BKS endpoint operations
#[derive(Error, Debug)]
pub enum BksError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error during negotiation or framing
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Negotiation did not complete in time
    #[error("Negotiation timeout after {0:?}")]
    NegotiationTimeout(Duration),

    /// Coordinator rejected the offered service
    #[error("Negotiation rejected by coordinator")]
    NegotiationRejected,

    /// None of the requested service types can be supplied
    #[error("No requested service type can be offered")]
    NoServiceOffered,

    /// Connection closed by peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// No traffic from peer within the negotiated keepalive period
    #[error("Keepalive expired after {0:?}")]
    KeepaliveExpired(Duration),

    /// Channel send error
    #[error("Channel send error")]
    ChannelSend,

    /// Channel receive error
    #[error("Channel receive error")]
    ChannelRecv,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for BKS operations
pub type Result<T> = std::result::Result<T, BksError>;

impl BksError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if a new connection attempt may succeed after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::AddrInUse
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::PermissionDenied
            ),
            Self::NegotiationTimeout(_)
            | Self::NegotiationRejected
            | Self::NoServiceOffered
            | Self::ConnectionClosed
            | Self::KeepaliveExpired(_)
            | Self::Protocol(_) => true,
            Self::ChannelSend | Self::ChannelRecv | Self::Config(_) => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::KeepaliveExpired(_) | Self::NegotiationTimeout(_)
        )
    }
}
