use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zget_core::SERVICE_TYPE;
use zget_core::discovery::{
    Advertisement, BrowseSession, DiscoveryRecord, Registration, ServiceBrowser, ServiceEvent,
    ServiceRegistry,
};

/// Multicast DNS-SD browser.  Every browse runs its own daemon, so closing
/// a session releases its sockets and ends the event pump.
pub struct MdnsBrowser;

/// A running mDNS browse.  Dropping it has the same effect as
/// [`close`](BrowseSession::close).
pub struct MdnsBrowseSession {
    daemon: ServiceDaemon,
    service_type: String,
    _pump: JoinHandle<()>,
}

impl ServiceBrowser for MdnsBrowser {
    type Session = MdnsBrowseSession;

    fn browse(
        &self,
        service_type: &str,
        record: Arc<DiscoveryRecord>,
    ) -> anyhow::Result<Self::Session> {
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
        let events = daemon
            .browse(service_type)
            .with_context(|| format!("failed to browse {service_type}"))?;
        info!(service_type = %service_type, "Browsing for peers");

        // The daemon delivers events over a blocking channel that closes
        // once the browse is stopped.
        let pump = tokio::task::spawn_blocking(move || {
            while let Ok(event) = events.recv() {
                match event {
                    mdns_sd::ServiceEvent::ServiceFound(_, fullname) => {
                        debug!(name = %fullname, "Service found, resolving");
                    }
                    mdns_sd::ServiceEvent::ServiceResolved(info) => {
                        let Some(ip) = preferred_address(info.get_addresses()) else {
                            warn!(name = %info.get_fullname(), "Resolved service has no address");
                            continue;
                        };
                        record.on_event(&ServiceEvent::Added {
                            fullname: info.get_fullname().to_owned(),
                            addr: SocketAddr::new(ip, info.get_port()),
                        });
                    }
                    mdns_sd::ServiceEvent::ServiceRemoved(_, fullname) => {
                        record.on_event(&ServiceEvent::Removed { fullname });
                    }
                    mdns_sd::ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
            debug!("mDNS event pump stopped");
        });

        Ok(MdnsBrowseSession {
            daemon,
            service_type: service_type.to_owned(),
            _pump: pump,
        })
    }
}

impl BrowseSession for MdnsBrowseSession {
    fn close(self) {
        drop(self);
    }
}

impl Drop for MdnsBrowseSession {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!(error = %e, "Failed to stop browse");
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "Failed to shut down mDNS daemon");
        }
        debug!(service_type = %self.service_type, "Browse session closed");
    }
}

/// IPv4 first, matching what legacy peers advertise; IPv6 otherwise.
fn preferred_address(addresses: &HashSet<IpAddr>) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()
}

/// Multicast DNS-SD publisher backed by one daemon.
pub struct MdnsRegistry {
    daemon: ServiceDaemon,
}

impl MdnsRegistry {
    /// Starts the mDNS daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot open its sockets.
    pub fn new() -> anyhow::Result<Self> {
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
        Ok(Self { daemon })
    }
}

impl Drop for MdnsRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "Failed to shut down mDNS daemon");
        }
    }
}

/// A published mDNS service instance.
pub struct MdnsRegistration {
    daemon: ServiceDaemon,
    fullname: String,
}

impl ServiceRegistry for MdnsRegistry {
    type Registration = MdnsRegistration;

    fn register(&self, advert: &Advertisement) -> anyhow::Result<Self::Registration> {
        let instance = advert.identity.as_str();
        let host = format!("zget-{}.local.", &instance[..instance.len().min(12)]);
        let properties = [("path", "")];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &host,
            advert.addr.ip(),
            advert.addr.port(),
            &properties[..],
        )
        .context("invalid service description")?;
        let fullname = info.get_fullname().to_owned();

        self.daemon
            .register(info)
            .with_context(|| format!("failed to register {fullname}"))?;
        info!(name = %fullname, addr = %advert.addr, "Broadcasting");

        Ok(MdnsRegistration {
            daemon: self.daemon.clone(),
            fullname,
        })
    }
}

impl Registration for MdnsRegistration {
    fn withdraw(self) {
        match self.daemon.unregister(&self.fullname) {
            Ok(_) => debug!(name = %self.fullname, "Advertisement withdrawn"),
            Err(e) => warn!(name = %self.fullname, error = %e, "Failed to withdraw advertisement"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn given_v4_and_v6_addresses_when_choosing_then_v4_wins() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let set = HashSet::from([v6, v4]);
        assert_eq!(preferred_address(&set), Some(v4));
    }

    #[test]
    fn given_only_v6_when_choosing_then_v6_is_used() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(preferred_address(&HashSet::from([v6])), Some(v6));
    }

    #[test]
    fn given_no_addresses_when_choosing_then_none() {
        assert_eq!(preferred_address(&HashSet::new()), None);
    }
}
