use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::identity::ServiceIdentity;

/// Notification delivered by a discovery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A service instance appeared and resolved to `addr`.
    Added { fullname: String, addr: SocketAddr },
    /// A service instance went away.
    Removed { fullname: String },
}

/// Per-session discovery state.
///
/// The discovery engine is the only writer (through
/// [`on_event`](Self::on_event)); the locator is the only reader.  The
/// resolved address and port live in one `SocketAddr` behind a mutex, so a
/// reader never sees half of the pair.  The first match wins and is never
/// replaced or retracted.
#[derive(Debug)]
pub struct DiscoveryRecord {
    target: ServiceIdentity,
    peer: Mutex<Option<SocketAddr>>,
}

impl DiscoveryRecord {
    #[must_use]
    pub fn new(target: ServiceIdentity) -> Self {
        Self {
            target,
            peer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn target(&self) -> &ServiceIdentity {
        &self.target
    }

    /// Resolved peer, once a matching advertisement arrived.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    /// Handles one discovery notification.  Returns `true` when the event
    /// committed the peer.
    pub fn on_event(&self, event: &ServiceEvent) -> bool {
        match event {
            ServiceEvent::Added { fullname, addr } => {
                if !self.target.matches_fullname(fullname) {
                    debug!(name = %fullname, "Ignoring unrelated service");
                    return false;
                }
                let mut peer = self.peer.lock();
                if let Some(existing) = *peer {
                    debug!(addr = %addr, existing = %existing, "Peer already resolved, ignoring");
                    return false;
                }
                info!(addr = %addr, "Peer found");
                *peer = Some(*addr);
                true
            }
            ServiceEvent::Removed { fullname } => {
                debug!(name = %fullname, "Service removed, ignoring");
                false
            }
        }
    }
}

/// A running browse, torn down by [`close`](BrowseSession::close).
pub trait BrowseSession: Send + 'static {
    /// Stops delivering events and releases the discovery resources.
    fn close(self);
}

/// Discovery engine able to browse a DNS-SD service type.
///
/// Keeping this behind a trait lets the locator run over real multicast in
/// production and over an in-memory network in tests.
pub trait ServiceBrowser: Send + Sync + 'static {
    /// The concrete session produced by [`browse`](ServiceBrowser::browse).
    type Session: BrowseSession;

    /// Starts browsing `service_type`, delivering every notification to
    /// `record` from the engine's own task.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot be started.
    fn browse(
        &self,
        service_type: &str,
        record: Arc<DiscoveryRecord>,
    ) -> anyhow::Result<Self::Session>;
}

/// Description of one advertised service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub identity: ServiceIdentity,
    pub addr: SocketAddr,
}

/// A live advertisement, withdrawn by [`withdraw`](Registration::withdraw).
pub trait Registration: Send + 'static {
    fn withdraw(self);
}

/// Discovery engine able to publish service instances.
pub trait ServiceRegistry: Send + Sync + 'static {
    type Registration: Registration;

    /// Publishes `advert` under the zget service type.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine refuses the registration.
    fn register(&self, advert: &Advertisement) -> anyhow::Result<Self::Registration>;
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::identity::SERVICE_TYPE;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), port)
    }

    #[test]
    fn given_matching_advertisement_when_added_then_peer_is_recorded() {
        let id = ServiceIdentity::derive("report.pdf");
        let record = DiscoveryRecord::new(id.clone());
        assert!(record.peer().is_none());

        let committed = record.on_event(&ServiceEvent::Added {
            fullname: id.instance_fullname(),
            addr: addr(7, 8000),
        });

        assert!(committed);
        assert_eq!(record.peer(), Some(addr(7, 8000)));
    }

    #[test]
    fn given_prefix_of_identity_when_added_then_ignored() {
        let id = ServiceIdentity::derive("report.pdf");
        let record = DiscoveryRecord::new(id.clone());

        record.on_event(&ServiceEvent::Added {
            fullname: format!("{}.{SERVICE_TYPE}", &id.as_str()[..8]),
            addr: addr(1, 1),
        });

        assert!(record.peer().is_none());
    }

    #[test]
    fn given_two_matches_when_added_then_first_wins() {
        let id = ServiceIdentity::derive("report.pdf");
        let record = DiscoveryRecord::new(id.clone());

        record.on_event(&ServiceEvent::Added {
            fullname: id.instance_fullname(),
            addr: addr(1, 1000),
        });
        let second = record.on_event(&ServiceEvent::Added {
            fullname: id.instance_fullname(),
            addr: addr(2, 2000),
        });

        assert!(!second);
        assert_eq!(record.peer(), Some(addr(1, 1000)));
    }

    #[test]
    fn given_resolved_peer_when_service_removed_then_peer_is_kept() {
        let id = ServiceIdentity::derive("report.pdf");
        let record = DiscoveryRecord::new(id.clone());
        record.on_event(&ServiceEvent::Added {
            fullname: id.instance_fullname(),
            addr: addr(3, 3000),
        });

        record.on_event(&ServiceEvent::Removed {
            fullname: id.instance_fullname(),
        });

        assert_eq!(record.peer(), Some(addr(3, 3000)));
    }
}
