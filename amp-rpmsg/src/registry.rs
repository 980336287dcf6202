//! Endpoint/service registry: services register interest in a name ahead
//! of time (or not), remote endpoint announcements arrive in whatever
//! order the remote core sends them, and the registry matches the two up.
//! An announcement that arrives before any matching service is registered
//! is queued, per client, rather than dropped — one registry instance
//! belongs to exactly one client, so multiple clients never share this
//! queue.

use crate::ns::NsFlags;
use crate::sender::EndpointSender;
use std::collections::HashMap;
use std::sync::Arc;

/// A local participant that wants to claim a name the remote side
/// advertises, and be told the remote address to talk to once bound.
pub trait Service: Send {
    fn name(&self) -> &str;

    fn ns_match(&self, name: &str) -> bool {
        self.name() == name
    }

    /// Called once a remote endpoint named `name` is available at
    /// `remote_addr`. Returns the local address this service wants to be
    /// reachable at, or `None` to decline the bind.
    fn ns_bind(&mut self, name: &str, remote_addr: u32) -> Option<u32>;

    /// Called for every non-name-service frame addressed to this service's
    /// bound local address.
    fn on_message(&mut self, _payload: &[u8]) {}

    /// Called once `ns_bind` succeeds, handing the service something to
    /// reply with. Default no-op for services that never send unsolicited
    /// traffic back.
    fn bind_sender(&mut self, _sender: Arc<dyn EndpointSender>) {}

    fn remove(&mut self) {}
}

struct PendingRemoteEndpoint {
    name: String,
    remote_addr: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundEndpoint {
    pub local_addr: u32,
    pub remote_addr: u32,
}

pub struct Registry {
    services: Vec<Box<dyn Service>>,
    bound: HashMap<u32, (BoundEndpoint, usize)>,
    pending_remote: Vec<PendingRemoteEndpoint>,
    sender: Option<Arc<dyn EndpointSender>>,
    /// Called with the full `(name, local_addr, remote_addr)` projection of
    /// `bound` after every change, so the EPT_TABLE resource-table entry
    /// can be regenerated to match. `None` until a client wires one up.
    on_bind_change: Option<Box<dyn FnMut(&[(String, u32, u32)]) + Send>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            bound: HashMap::new(),
            pending_remote: Vec::new(),
            sender: None,
            on_bind_change: None,
        }
    }

    /// Supplies the shared transmit handle every bound service gets handed
    /// via `Service::bind_sender`. Set once before the receive loop starts.
    pub fn set_sender(&mut self, sender: Arc<dyn EndpointSender>) {
        self.sender = Some(sender);
    }

    /// Wires up the callback that regenerates the EPT_TABLE resource-table
    /// entry. Set once before the receive loop starts; survives a stop/
    /// start cycle along with the rest of the registry.
    pub fn set_on_bind_change(&mut self, cb: Box<dyn FnMut(&[(String, u32, u32)]) + Send>) {
        self.on_bind_change = Some(cb);
    }

    /// `(service name, local_addr, remote_addr)` for every currently bound
    /// endpoint — the exact projection the EPT_TABLE entry mirrors.
    fn ept_projection(&self) -> Vec<(String, u32, u32)> {
        self.bound
            .values()
            .map(|(b, idx)| (self.services[*idx].name().to_string(), b.local_addr, b.remote_addr))
            .collect()
    }

    fn notify_bind_change(&mut self) {
        if self.on_bind_change.is_some() {
            let projection = self.ept_projection();
            if let Some(cb) = self.on_bind_change.as_mut() {
                cb(&projection);
            }
        }
    }

    /// Seeds the pending-remote queue from resource-table EPT_TABLE entries
    /// left over from before a restart, so a service re-registering after
    /// `start()` rebinds immediately instead of waiting for a fresh
    /// announcement the remote side may never resend.
    pub fn seed_pending(&mut self, entries: &[(String, u32)]) {
        for (name, remote_addr) in entries {
            if *remote_addr == 0 {
                continue;
            }
            if self.pending_remote.iter().any(|p| p.name == *name && p.remote_addr == *remote_addr) {
                continue;
            }
            self.pending_remote.push(PendingRemoteEndpoint {
                name: name.clone(),
                remote_addr: *remote_addr,
            });
        }
    }

    /// Registers a service and immediately tries it against any remote
    /// announcements that arrived before it existed.
    pub fn register_service(&mut self, mut svc: Box<dyn Service>) -> Option<BoundEndpoint> {
        let idx = self.services.len();
        if let Some(i) = self
            .pending_remote
            .iter()
            .position(|p| svc.ns_match(&p.name))
        {
            let pending = self.pending_remote.remove(i);
            if let Some(local_addr) = svc.ns_bind(&pending.name, pending.remote_addr) {
                if let Some(sender) = &self.sender {
                    svc.bind_sender(sender.clone());
                }
                let bound = BoundEndpoint {
                    local_addr,
                    remote_addr: pending.remote_addr,
                };
                self.bound.insert(local_addr, (bound, idx));
                self.services.push(svc);
                self.notify_bind_change();
                return Some(bound);
            }
        }
        self.services.push(svc);
        None
    }

    /// Handles a name-service announcement. On `Create`, tries every
    /// registered service in order; the first match wins and is bound. No
    /// match means the announcement is queued. On `Destroy`, any bound
    /// endpoint or queued announcement for that remote address is dropped.
    pub fn handle_announce(
        &mut self,
        name: &str,
        remote_addr: u32,
        flags: NsFlags,
    ) -> Option<BoundEndpoint> {
        match flags {
            NsFlags::Create => {
                if let Some((idx, svc)) = self
                    .services
                    .iter_mut()
                    .enumerate()
                    .find(|(_, s)| s.ns_match(name))
                {
                    if let Some(local_addr) = svc.ns_bind(name, remote_addr) {
                        if let Some(sender) = &self.sender {
                            svc.bind_sender(sender.clone());
                        }
                        let bound = BoundEndpoint { local_addr, remote_addr };
                        self.bound.insert(local_addr, (bound, idx));
                        self.notify_bind_change();
                        return Some(bound);
                    }
                }
                self.pending_remote.push(PendingRemoteEndpoint {
                    name: name.to_string(),
                    remote_addr,
                });
                None
            }
            NsFlags::Destroy => {
                self.pending_remote.retain(|p| p.remote_addr != remote_addr);
                let stale: Vec<u32> = self
                    .bound
                    .iter()
                    .filter(|(_, (b, _))| b.remote_addr == remote_addr)
                    .map(|(addr, _)| *addr)
                    .collect();
                let any_removed = !stale.is_empty();
                for addr in stale {
                    self.bound.remove(&addr);
                }
                for svc in self.services.iter_mut().filter(|s| s.ns_match(name)) {
                    svc.remove();
                }
                if any_removed {
                    self.notify_bind_change();
                }
                None
            }
        }
    }

    pub fn lookup(&self, local_addr: u32) -> Option<BoundEndpoint> {
        self.bound.get(&local_addr).map(|(b, _)| *b)
    }

    /// Routes a payload to whichever service is bound at `local_addr`.
    /// Returns `false` if nothing is bound there (an unroutable frame).
    pub fn dispatch(&mut self, local_addr: u32, payload: &[u8]) -> bool {
        match self.bound.get(&local_addr) {
            Some(&(_, idx)) => {
                self.services[idx].on_message(payload);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_remote.len()
    }

    /// `(service name, bound local address if any)` for every registered
    /// service, in registration order — used for status reporting.
    pub fn service_status(&self) -> Vec<(&str, Option<u32>)> {
        self.services
            .iter()
            .enumerate()
            .map(|(idx, svc)| {
                let bound_addr = self
                    .bound
                    .iter()
                    .find(|(_, (_, i))| *i == idx)
                    .map(|(addr, _)| *addr);
                (svc.name(), bound_addr)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        name: String,
        received: Vec<u8>,
    }

    impl Service for Echo {
        fn name(&self) -> &str {
            &self.name
        }
        fn ns_bind(&mut self, _name: &str, _remote_addr: u32) -> Option<u32> {
            Some(100)
        }
        fn on_message(&mut self, payload: &[u8]) {
            self.received.extend_from_slice(payload);
        }
    }

    #[test]
    fn announce_before_service_is_queued_then_matched_on_register() {
        let mut reg = Registry::new();
        assert!(reg
            .handle_announce("rpmsg-rpc", 0x10, NsFlags::Create)
            .is_none());
        assert_eq!(reg.pending_count(), 1);

        let bound = reg.register_service(Box::new(Echo {
            name: "rpmsg-rpc".to_string(),
            received: Vec::new(),
        }));
        assert!(bound.is_some());
        assert_eq!(reg.pending_count(), 0);
        assert_eq!(reg.lookup(100).unwrap().remote_addr, 0x10);
    }

    #[test]
    fn announce_after_service_binds_immediately() {
        let mut reg = Registry::new();
        reg.register_service(Box::new(Echo {
            name: "rpmsg-rpc".to_string(),
            received: Vec::new(),
        }));
        let bound = reg
            .handle_announce("rpmsg-rpc", 0x20, NsFlags::Create)
            .unwrap();
        assert_eq!(bound.local_addr, 100);
        assert_eq!(reg.lookup(100).unwrap().remote_addr, 0x20);
    }

    #[test]
    fn destroy_clears_bound_and_pending() {
        let mut reg = Registry::new();
        reg.handle_announce("unmatched", 0x30, NsFlags::Create);
        assert_eq!(reg.pending_count(), 1);
        reg.handle_announce("unmatched", 0x30, NsFlags::Destroy);
        assert_eq!(reg.pending_count(), 0);
    }

    #[test]
    fn bind_change_callback_fires_on_bind_and_on_destroy() {
        use std::sync::{Arc, Mutex};

        let seen: Arc<Mutex<Vec<Vec<(String, u32, u32)>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut reg = Registry::new();
        reg.set_on_bind_change({
            let seen = seen.clone();
            Box::new(move |projection| seen.lock().unwrap().push(projection.to_vec()))
        });
        reg.register_service(Box::new(Echo {
            name: "rpmsg-rpc".to_string(),
            received: Vec::new(),
        }));
        reg.handle_announce("rpmsg-rpc", 0x50, NsFlags::Create);
        reg.handle_announce("rpmsg-rpc", 0x50, NsFlags::Destroy);

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec![("rpmsg-rpc".to_string(), 100, 0x50)]);
        assert!(calls[1].is_empty());
    }

    #[test]
    fn seed_pending_skips_zero_addr_and_duplicates() {
        let mut reg = Registry::new();
        reg.seed_pending(&[
            ("rpmsg-rpc".to_string(), 0),
            ("rpmsg-rpc".to_string(), 0x60),
        ]);
        assert_eq!(reg.pending_count(), 1);
        reg.seed_pending(&[("rpmsg-rpc".to_string(), 0x60)]);
        assert_eq!(reg.pending_count(), 1);

        let bound = reg
            .register_service(Box::new(Echo {
                name: "rpmsg-rpc".to_string(),
                received: Vec::new(),
            }))
            .unwrap();
        assert_eq!(bound.remote_addr, 0x60);
    }

    #[test]
    fn dispatch_routes_to_bound_service() {
        let mut reg = Registry::new();
        reg.register_service(Box::new(Echo {
            name: "rpmsg-rpc".to_string(),
            received: Vec::new(),
        }));
        reg.handle_announce("rpmsg-rpc", 0x40, NsFlags::Create);
        assert!(reg.dispatch(100, b"hi"));
        assert!(!reg.dispatch(999, b"nope"));
    }
}
