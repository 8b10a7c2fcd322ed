//! Guest-agent transport: vsock handshake, pooled multiplexed RPC, exec
//! and copy streaming (`spec.md` §4.4, C9).

pub mod copy;
pub mod exec;
pub mod handshake;
pub mod pool;
pub mod protocol;

pub use handshake::handshake;
pub use pool::{Channel, Connection, Pool};

#[derive(Debug, thiserror::Error)]
pub enum GuestRpcError {
    #[error("io error: {0}")]
    Io(std::io::Error),

    #[error("vsock handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("guest rpc connection closed")]
    ConnectionClosed,

    #[error("copy failed: {0}")]
    CopyFailed(String),
}

impl GuestRpcError {
    /// `spec.md` §7: vsock handshake failure is `Transient`; everything
    /// else here is a copy/connection failure surfaced as-is to the
    /// caller.
    pub fn classify(self) -> crate::error::HypemanError {
        use crate::error::HypemanError;
        match self {
            GuestRpcError::HandshakeFailed(_) | GuestRpcError::ConnectionClosed => {
                HypemanError::Transient(self.to_string())
            }
            other => HypemanError::Internal(other.to_string()),
        }
    }
}
