use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use zget_core::discovery::{BrowseSession, DiscoveryRecord, ServiceBrowser};
use zget_core::{SERVICE_TYPE, ServiceIdentity, ZgetError};

/// Default interval between two looks at the discovery record.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of a [`PeerLocator::locate`] call that did not fail.
pub enum Discovery<S> {
    /// A peer advertising the identity was found.  The browse session is
    /// still open; the caller closes it once the transfer is over.
    Found { peer: SocketAddr, session: S },
    /// The caller cancelled the search.  The session is already closed.
    Cancelled,
}

/// Waits for a peer advertising a given identity.
///
/// The browse itself runs on the engine's task; the locator only polls the
/// shared [`DiscoveryRecord`] every `poll_interval`, so a timeout is noticed
/// at most one interval late.
pub struct PeerLocator<B> {
    browser: B,
    poll_interval: Duration,
}

impl<B: ServiceBrowser> PeerLocator<B> {
    pub fn new(browser: B) -> Self {
        Self {
            browser,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Browses for `identity` until it is found, `timeout` elapses or
    /// `cancel` fires.  `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// - [`ZgetError::Discovery`] if the browse could not be started.
    /// - [`ZgetError::PeerNotFound`] if `timeout` elapsed first.  The
    ///   session is closed before returning.
    pub async fn locate(
        &self,
        identity: &ServiceIdentity,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Discovery<B::Session>, ZgetError> {
        let record = Arc::new(DiscoveryRecord::new(identity.clone()));
        let session = self
            .browser
            .browse(SERVICE_TYPE, Arc::clone(&record))
            .map_err(ZgetError::Discovery)?;
        debug!(name = %identity.instance_fullname(), ?timeout, "Looking for peer");

        let started = Instant::now();
        loop {
            if let Some(peer) = record.peer() {
                return Ok(Discovery::Found { peer, session });
            }

            if let Some(limit) = timeout {
                if started.elapsed() > limit {
                    session.close();
                    info!(name = %identity.instance_fullname(), "No peer found before timeout");
                    return Err(ZgetError::PeerNotFound {
                        identity: identity.clone(),
                        timeout: limit,
                    });
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    session.close();
                    info!("Discovery cancelled");
                    return Ok(Discovery::Cancelled);
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use zget_core::discovery::{Advertisement, Registration, ServiceRegistry};

    use super::*;
    use crate::memory::MemoryNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test(start_paused = true)]
    async fn given_no_peer_when_timeout_elapses_then_not_found_within_one_interval() {
        let net = MemoryNetwork::new();
        let locator = PeerLocator::new(net.clone());
        let identity = ServiceIdentity::derive("missing.bin");
        let timeout = Duration::from_secs(2);

        let started = Instant::now();
        let result = locator
            .locate(&identity, Some(timeout), &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(ZgetError::PeerNotFound { timeout: t, .. }) if t == timeout
        ));
        assert!(elapsed >= timeout);
        // The timer wheel rounds every sleep up to the next millisecond.
        assert!(elapsed <= timeout + DEFAULT_POLL_INTERVAL + Duration::from_millis(10));
        assert_eq!(net.active_browses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn given_late_advertisement_when_locating_then_first_peer_is_returned() {
        let net = MemoryNetwork::new();
        let identity = ServiceIdentity::derive("late.bin");

        let publisher = net.clone();
        let advertised = identity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let first = publisher
                .register(&Advertisement {
                    identity: advertised.clone(),
                    addr: addr(7001),
                })
                .unwrap();
            let second = publisher
                .register(&Advertisement {
                    identity: advertised,
                    addr: addr(7002),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            first.withdraw();
            second.withdraw();
        });

        let locator = PeerLocator::new(net.clone()).with_poll_interval(Duration::from_millis(100));
        let result = locator
            .locate(&identity, Some(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();

        match result {
            Discovery::Found { peer, session } => {
                assert_eq!(peer, addr(7001));
                assert_eq!(net.active_browses(), 1);
                session.close();
                assert_eq!(net.active_browses(), 0);
            }
            Discovery::Cancelled => panic!("expected a peer"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn given_unrelated_advertisements_when_locating_then_they_are_ignored() {
        let net = MemoryNetwork::new();
        let _other = net.announce(ServiceIdentity::derive("other.bin").instance_fullname(), addr(1));

        let locator = PeerLocator::new(net.clone());
        let result = locator
            .locate(
                &ServiceIdentity::derive("wanted.bin"),
                Some(Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ZgetError::PeerNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn given_no_timeout_when_cancelled_then_discovery_stops_cleanly() {
        let net = MemoryNetwork::new();
        let locator = PeerLocator::new(net.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let result = locator
            .locate(&ServiceIdentity::derive("forever.bin"), None, &cancel)
            .await
            .unwrap();

        assert!(matches!(result, Discovery::Cancelled));
        assert_eq!(net.active_browses(), 0);
    }
}
