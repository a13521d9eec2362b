//! SMTP Mux - multiplexed TCP tunnel disguised as SMTP
//!
//! One TLS connection carries many independent TCP streams ("channels").
//! The first bytes on the wire are an SMTP-looking exchange so passive DPI
//! classifies the connection as mail submission; afterwards the stream carries
//! binary frames only.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      ┌─────────────┐      ┌─────────────┐      ┌──────────────┐
//! │ Application │─────▶│   Client    │─────▶│   Server    │─────▶│ Destination  │
//! │             │ TCP  │   Tunnel    │ SMTP │  Port 587   │ TCP  │              │
//! │             │◀─────│             │◀─────│  Sessions   │◀─────│              │
//! └─────────────┘      └─────────────┘      └─────────────┘      └──────────────┘
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod crypto;
pub mod forwarder;
pub mod handshake;
pub mod proto;
pub mod server;
pub mod session;

// Re-export commonly used items
pub use channel::{Channel, ChannelTable};
pub use client::{Client, Credentials, Tunnel};
pub use config::{ClientConfig, Config, LoggingConfig, ServerConfig, UserEntry, UsersConfig};
pub use crypto::{AuthToken, Authenticator};
pub use proto::{Frame, FrameCodec, FrameType};
pub use server::Server;

use thiserror::Error;

/// Error types for SMTP Mux
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("payload too large: {0} bytes")]
    InvalidPayload(usize),

    #[error("channel {0} is already open")]
    DuplicateChannel(u16),

    #[error("failed to connect to {target}: {source}")]
    DialFailure {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    DialTimeout(String),

    #[error("channel {0} not found")]
    ChannelNotFound(u16),

    #[error("peer refused channel {0}")]
    ConnectRejected(u16),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<proto::FrameError> for Error {
    fn from(err: proto::FrameError) -> Self {
        match err {
            proto::FrameError::Io(e) => Self::Transport(e),
            proto::FrameError::PayloadTooLarge(len) => Self::InvalidPayload(len),
            proto::FrameError::Malformed(msg) => Self::MalformedFrame(msg),
        }
    }
}

/// Result type for SMTP Mux
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
