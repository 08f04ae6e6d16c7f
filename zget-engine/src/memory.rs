//! In-process DNS-SD stand-in.
//!
//! [`MemoryNetwork`] implements both discovery seams over a shared table,
//! so a sender and a receiver in the same process find each other without
//! multicast.  Events are pushed from a per-browse task, like the mDNS
//! backend does.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use zget_core::discovery::{
    Advertisement, BrowseSession, DiscoveryRecord, Registration, ServiceBrowser, ServiceEvent,
    ServiceRegistry,
};

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    /// Published instances: `(id, fullname, addr)`.
    services: Vec<(u64, String, SocketAddr)>,
    /// Active browses: `(id, service type, event sink)`.
    browsers: Vec<(u64, String, mpsc::UnboundedSender<ServiceEvent>)>,
}

impl NetworkState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn broadcast(&self, event: &ServiceEvent) {
        let fullname = match event {
            ServiceEvent::Added { fullname, .. } | ServiceEvent::Removed { fullname } => fullname,
        };
        for (_, service_type, tx) in &self.browsers {
            if fullname.ends_with(service_type.as_str()) {
                let _ = tx.send(event.clone());
            }
        }
    }
}

/// Shared in-memory service table.  Clones see the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an arbitrary instance name, bypassing identity derivation.
    /// The returned handle withdraws it.
    pub fn announce(&self, fullname: impl Into<String>, addr: SocketAddr) -> MemoryRegistration {
        let fullname = fullname.into();
        let mut state = self.state.lock();
        let id = state.next_id();
        state.services.push((id, fullname.clone(), addr));
        state.broadcast(&ServiceEvent::Added {
            fullname: fullname.clone(),
            addr,
        });
        debug!(name = %fullname, addr = %addr, "Announced in memory");
        MemoryRegistration {
            id,
            fullname,
            state: Arc::clone(&self.state),
        }
    }

    /// Currently published instances.
    #[must_use]
    pub fn services(&self) -> Vec<(String, SocketAddr)> {
        self.state
            .lock()
            .services
            .iter()
            .map(|(_, name, addr)| (name.clone(), *addr))
            .collect()
    }

    /// Number of browses not yet closed.
    #[must_use]
    pub fn active_browses(&self) -> usize {
        self.state.lock().browsers.len()
    }
}

/// Browse handle for [`MemoryNetwork`].
pub struct MemoryBrowseSession {
    id: u64,
    state: Arc<Mutex<NetworkState>>,
    task: JoinHandle<()>,
}

impl ServiceBrowser for MemoryNetwork {
    type Session = MemoryBrowseSession;

    fn browse(
        &self,
        service_type: &str,
        record: Arc<DiscoveryRecord>,
    ) -> anyhow::Result<Self::Session> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id();
            for (_, fullname, addr) in &state.services {
                if fullname.ends_with(service_type) {
                    let _ = tx.send(ServiceEvent::Added {
                        fullname: fullname.clone(),
                        addr: *addr,
                    });
                }
            }
            state.browsers.push((id, service_type.to_owned(), tx));
            id
        };

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                record.on_event(&event);
            }
        });

        Ok(MemoryBrowseSession {
            id,
            state: Arc::clone(&self.state),
            task,
        })
    }
}

impl BrowseSession for MemoryBrowseSession {
    fn close(self) {
        drop(self);
    }
}

impl Drop for MemoryBrowseSession {
    fn drop(&mut self) {
        self.state.lock().browsers.retain(|(id, _, _)| *id != self.id);
        self.task.abort();
    }
}

/// Publication handle for [`MemoryNetwork`].
pub struct MemoryRegistration {
    id: u64,
    fullname: String,
    state: Arc<Mutex<NetworkState>>,
}

impl ServiceRegistry for MemoryNetwork {
    type Registration = MemoryRegistration;

    fn register(&self, advert: &Advertisement) -> anyhow::Result<Self::Registration> {
        Ok(self.announce(advert.identity.instance_fullname(), advert.addr))
    }
}

impl Registration for MemoryRegistration {
    fn withdraw(self) {
        let mut state = self.state.lock();
        state.services.retain(|(id, _, _)| *id != self.id);
        state.broadcast(&ServiceEvent::Removed {
            fullname: self.fullname.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use zget_core::{SERVICE_TYPE, ServiceIdentity};

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn given_existing_service_when_browsing_then_record_resolves() {
        let net = MemoryNetwork::new();
        let id = ServiceIdentity::derive("a.txt");
        let reg = net
            .register(&Advertisement {
                identity: id.clone(),
                addr: addr(4000),
            })
            .unwrap();

        let record = Arc::new(DiscoveryRecord::new(id));
        let session = net.browse(SERVICE_TYPE, Arc::clone(&record)).unwrap();
        settle().await;

        assert_eq!(record.peer(), Some(addr(4000)));
        session.close();
        reg.withdraw();
        assert!(net.services().is_empty());
    }

    #[tokio::test]
    async fn given_active_browse_when_service_registered_then_record_resolves() {
        let net = MemoryNetwork::new();
        let id = ServiceIdentity::derive("b.txt");
        let record = Arc::new(DiscoveryRecord::new(id.clone()));
        let session = net.browse(SERVICE_TYPE, Arc::clone(&record)).unwrap();

        let _reg = net.announce(id.instance_fullname(), addr(5000));
        settle().await;

        assert_eq!(record.peer(), Some(addr(5000)));
        drop(session);
    }

    #[tokio::test]
    async fn given_other_service_type_when_browsing_then_nothing_is_delivered() {
        let net = MemoryNetwork::new();
        let id = ServiceIdentity::derive("c.txt");
        let _reg = net.announce(format!("{}._other._tcp.local.", id.as_str()), addr(6000));

        let record = Arc::new(DiscoveryRecord::new(id));
        let _session = net.browse(SERVICE_TYPE, Arc::clone(&record)).unwrap();
        settle().await;

        assert!(record.peer().is_none());
    }

    #[tokio::test]
    async fn when_session_closed_expect_browser_removed() {
        let net = MemoryNetwork::new();
        let record = Arc::new(DiscoveryRecord::new(ServiceIdentity::derive("d.txt")));
        let session = net.browse(SERVICE_TYPE, record).unwrap();
        assert_eq!(net.active_browses(), 1);

        session.close();
        assert_eq!(net.active_browses(), 0);
    }
}
