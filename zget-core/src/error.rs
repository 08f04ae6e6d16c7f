use std::time::Duration;

use thiserror::Error;

use crate::identity::ServiceIdentity;

/// Failures of the cipher layer: handshake and sealed-stream integrity.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The binary was built without the `pake` feature.
    #[error("password-authenticated encryption is not available in this build")]
    Unavailable,

    #[error("a password is required unless encryption is bypassed")]
    MissingPassword,

    /// The peer did not send its half of the key exchange.
    #[error("peer did not take part in the key exchange")]
    MissingKeyExchange,

    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// A sealed frame failed authentication (wrong password or tampering).
    #[error("sealed frame {frame} failed authentication")]
    Integrity { frame: u64 },

    #[error("failed to seal frame {frame}")]
    Seal { frame: u64 },

    /// The sealed stream ended without its final frame.
    #[error("sealed stream was truncated")]
    Truncated,
}

/// Terminal failure of a receive or share run.
///
/// User cancellation is deliberately absent: it is a clean stop and is
/// reported as an `Ok` outcome by the callers that support it.
#[derive(Debug, Error)]
pub enum ZgetError {
    /// The cryptographic backend cannot be used. Fatal, retrying won't help.
    #[error("cipher suite unavailable: {0}")]
    CapabilityUnavailable(#[source] CipherError),

    /// No peer advertised the identity before the discovery timeout.
    #[error("no peer advertised {identity} within {timeout:?}")]
    PeerNotFound {
        identity: ServiceIdentity,
        timeout: Duration,
    },

    /// Discovery could not be started (mDNS daemon, sockets, ...).
    #[error("service discovery failed")]
    Discovery(#[source] anyhow::Error),

    /// Network or filesystem failure while moving file bytes.
    #[error("transfer failed")]
    TransferFailed(#[source] anyhow::Error),

    /// The stream or handshake failed authentication.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[source] CipherError),

    /// Share side: nobody downloaded the file before the timeout.
    #[error("file was not downloaded within {timeout:?}")]
    ShareTimedOut { timeout: Duration },

    /// The request itself is unusable (missing input file, bad port, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ZgetError {
    /// Returns `true` for failures a caller may retry from scratch.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PeerNotFound { .. } | Self::TransferFailed(_) | Self::ShareTimedOut { .. }
        )
    }
}

impl From<CipherError> for ZgetError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Unavailable => Self::CapabilityUnavailable(err),
            CipherError::MissingPassword => Self::InvalidRequest(err.to_string()),
            other => Self::AuthenticationFailed(other),
        }
    }
}
