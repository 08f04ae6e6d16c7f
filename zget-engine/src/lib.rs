//! # zget-engine
//!
//! Runtime side of zget, embedded into the CLI.
//!
//! This crate provides:
//! - **Discovery backends**: multicast DNS-SD ([`mdns`]) and an in-process
//!   network for tests ([`memory`])
//! - **Peer locator**: polls a discovery record until a peer shows up, the
//!   timeout elapses or the caller cancels
//! - **Transfer client**: HTTP download with key exchange, stream
//!   decryption, progress reporting and atomic output
//! - **Receive orchestrator**: the phase machine tying the above together,
//!   with a per-phase interrupt policy
//! - **Share server**: the sending counterpart, serving one file until it
//!   has been downloaded

pub mod locator;
pub mod mdns;
pub mod memory;
pub mod receiver;
pub mod share;
pub mod transfer;

use tokio_util::sync::CancellationToken;

use zget_core::{Ciphersuite, ZgetError};

pub use receiver::{GetOutcome, GetRequest, Phase, Receiver};
pub use share::{ShareOutcome, ShareRequest, Sharer};
pub use transfer::{ProgressHook, TransferProgress};

use crate::mdns::{MdnsBrowser, MdnsRegistry};

/// Fetches one file from whichever peer advertises it over mDNS.
///
/// # Errors
///
/// See [`Receiver::get`].
pub async fn get(
    request: &GetRequest,
    ciphersuite: &Ciphersuite,
    progress: Option<ProgressHook>,
    poll_interval: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<GetOutcome, ZgetError> {
    Receiver::new(MdnsBrowser)?
        .with_poll_interval(poll_interval)
        .get(request, ciphersuite, progress, cancel)
        .await
}

/// Shares one file over mDNS until it has been downloaded.
///
/// # Errors
///
/// See [`Sharer::share`].
pub async fn put(
    request: ShareRequest,
    ciphersuite: Ciphersuite,
    progress: Option<ProgressHook>,
    cancel: &CancellationToken,
) -> Result<ShareOutcome, ZgetError> {
    let registry = MdnsRegistry::new().map_err(ZgetError::Discovery)?;
    Sharer::new(registry)
        .share(request, ciphersuite, progress, cancel)
        .await
}
