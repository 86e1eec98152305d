// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Session storage. Sessions live in an arena of generation checked
//! slots; every index (id, peer address, routes, close-wait list) holds
//! handles, never sessions.

use super::session::Session;
use super::Error;
use crate::tunnel::Protocol;
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    session: Option<Session>,
}

pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_id: HashMap<(Protocol, u16), SessionHandle>,
    by_peer: HashMap<IpAddr, Vec<SessionHandle>>,
    routes: IpNetworkTable<SessionHandle>,
    close_wait: VecDeque<SessionHandle>,
    max_sessions: usize,
}

fn networks(session: &Session) -> impl Iterator<Item = IpNetwork> {
    let v4 = session.ip_address.map(IpNetwork::V4);
    let v6 = session.ip6_network.map(IpNetwork::V6);
    v4.into_iter().chain(v6)
}

impl Registry {
    pub fn new(max_sessions: usize) -> Registry {
        Registry {
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            by_peer: HashMap::new(),
            routes: IpNetworkTable::new(),
            close_wait: VecDeque::new(),
            max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Register `session` in every index, or in none of them.
    pub fn insert(&mut self, session: Session) -> Result<SessionHandle, Error> {
        let key = (session.protocol(), session.session_id);
        if self.by_id.contains_key(&key) {
            return Err(Error::SessionExists);
        }
        for net in networks(&session) {
            let addr = net.network_address();
            if self.routes.longest_match(addr).is_some() || self.routes.exact_match(net).is_some() {
                return Err(Error::AddressInUse(addr));
            }
        }
        if self.len() >= self.max_sessions {
            return Err(Error::Resource);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let handle = SessionHandle {
            index,
            generation: slot.generation,
        };

        self.by_id.insert(key, handle);
        for net in networks(&session) {
            self.routes.insert(net, handle);
        }
        if let Some(peer) = session.peer_address() {
            self.by_peer.entry(peer).or_default().push(handle);
        }
        slot.session = Some(session);
        Ok(handle)
    }

    /// Unregister and return the session. Its handle is dead afterwards.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        self.by_id.remove(&(session.protocol(), session.session_id));
        for net in networks(&session) {
            self.routes.remove(net);
        }
        if let Some(peer) = session.peer_address() {
            if let Some(list) = self.by_peer.get_mut(&peer) {
                list.retain(|h| *h != handle);
                if list.is_empty() {
                    self.by_peer.remove(&peer);
                }
            }
        }
        self.close_wait.retain(|h| *h != handle);
        Some(session)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_ref())
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_mut())
    }

    pub fn find_by_id(&self, protocol: Protocol, session_id: u16) -> Option<SessionHandle> {
        self.by_id.get(&(protocol, session_id)).copied()
    }

    /// Most specific session route covering `addr`.
    pub fn find_by_address(&self, addr: IpAddr) -> Option<SessionHandle> {
        self.routes.longest_match(addr).map(|(_, handle)| *handle)
    }

    /// A session whose tunnel peer is `peer` and that satisfies `pred`.
    pub fn find_by_peer<F>(&self, peer: IpAddr, pred: F) -> Option<SessionHandle>
    where
        F: Fn(&Session) -> bool,
    {
        self.by_peer
            .get(&peer)?
            .iter()
            .copied()
            .find(|h| self.get(*h).map_or(false, &pred))
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.by_id.values().copied().collect()
    }

    pub fn push_close_wait(&mut self, handle: SessionHandle) {
        if !self.close_wait.contains(&handle) {
            self.close_wait.push_back(handle);
        }
    }

    pub fn remove_close_wait(&mut self, handle: SessionHandle) {
        self.close_wait.retain(|h| *h != handle);
    }

    /// Take up to `limit` close-wait sessions matching `pred`. The flag is
    /// set when matching sessions were left behind.
    pub fn drain_close_wait<F>(&mut self, limit: usize, pred: F) -> (Vec<SessionHandle>, bool)
    where
        F: Fn(&Session) -> bool,
    {
        let mut taken = Vec::new();
        let mut more = false;
        let mut kept = VecDeque::with_capacity(self.close_wait.len());

        while let Some(handle) = self.close_wait.pop_front() {
            let matches = self.get(handle).map_or(false, &pred);
            if !matches {
                kept.push_back(handle);
            } else if taken.len() < limit {
                taken.push(handle);
            } else {
                more = true;
                kept.push_back(handle);
            }
        }
        self.close_wait = kept;
        (taken, more)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::session::SessionRequest;
    use crate::context::tests::RecordingStack;
    use crate::context::IfaceId;
    use std::net::Ipv4Addr;

    fn pppoe(id: u16, addr: Option<Ipv4Addr>) -> Session {
        let req = SessionRequest {
            protocol: Protocol::Pppoe as u8,
            session_id: id,
            peer_session_id: id,
            over_ifname: Some("eth0".into()),
            peer_mac: Some([2, 0, 0, 0, 0, id as u8]),
            ip_address: addr,
            ..Default::default()
        };
        Session::from_request(IfaceId(0), &req, &RecordingStack::default()).unwrap()
    }

    fn l2tp(id: u16, peer: &str) -> Session {
        let req = SessionRequest {
            protocol: Protocol::L2tp as u8,
            session_id: id,
            peer_session_id: id + 100,
            peer_address: Some(peer.parse().unwrap()),
            local_address: Some("192.0.2.254:1701".parse().unwrap()),
            ..Default::default()
        };
        Session::from_request(IfaceId(0), &req, &RecordingStack::default()).unwrap()
    }

    #[test]
    fn unique_ids_and_addresses() {
        let mut reg = Registry::new(16);
        let a = reg.insert(pppoe(7, Some(Ipv4Addr::new(10, 0, 0, 7)))).unwrap();
        assert!(matches!(reg.insert(pppoe(7, None)), Err(Error::SessionExists)));
        assert!(matches!(
            reg.insert(pppoe(8, Some(Ipv4Addr::new(10, 0, 0, 7)))),
            Err(Error::AddressInUse(_))
        ));
        // A failed insert leaves nothing behind.
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.find_by_id(Protocol::Pppoe, 8), None);

        assert_eq!(reg.find_by_address("10.0.0.7".parse().unwrap()), Some(a));
        assert_eq!(reg.find_by_address("10.0.0.8".parse().unwrap()), None);

        // Same id under another protocol is a different session.
        reg.insert(l2tp(7, "192.0.2.1:1701")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut reg = Registry::new(16);
        let a = reg.insert(pppoe(1, Some(Ipv4Addr::new(10, 0, 0, 1)))).unwrap();
        assert!(reg.remove(a).is_some());
        assert!(reg.get(a).is_none());
        assert!(reg.remove(a).is_none());
        assert_eq!(reg.find_by_address("10.0.0.1".parse().unwrap()), None);

        // The slot is reused under a new generation.
        let b = reg.insert(pppoe(2, None)).unwrap();
        assert_ne!(a, b);
        assert!(reg.get(a).is_none());
        assert_eq!(reg.get(b).unwrap().session_id, 2);
    }

    #[test]
    fn capacity() {
        let mut reg = Registry::new(1);
        reg.insert(pppoe(1, None)).unwrap();
        assert!(matches!(reg.insert(pppoe(2, None)), Err(Error::Resource)));
    }

    #[test]
    fn peer_index() {
        let mut reg = Registry::new(16);
        let a = reg.insert(l2tp(1, "192.0.2.1:1701")).unwrap();
        let b = reg.insert(l2tp(2, "192.0.2.1:1701")).unwrap();
        let peer: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(reg.find_by_peer(peer, |s| s.peer_session_id == 102), Some(b));
        reg.remove(b);
        assert_eq!(reg.find_by_peer(peer, |s| s.peer_session_id == 102), None);
        assert_eq!(reg.find_by_peer(peer, |_| true), Some(a));
    }

    #[test]
    fn close_wait_batches() {
        let mut reg = Registry::new(16);
        let handles: Vec<_> = (1..=3).map(|id| reg.insert(pppoe(id, None)).unwrap()).collect();
        for h in &handles {
            reg.push_close_wait(*h);
        }
        reg.push_close_wait(handles[0]);

        let (taken, more) = reg.drain_close_wait(2, |_| true);
        assert_eq!(taken, handles[..2].to_vec());
        assert!(more);
        let (taken, more) = reg.drain_close_wait(2, |_| true);
        assert_eq!(taken, vec![handles[2]]);
        assert!(!more);
    }
}
