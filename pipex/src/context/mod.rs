// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The pipex context: every session, both packet queues and the control
//! operations, behind one lock.
//!
//! Tunnel packets enter through `pppoe_input`, `pptp_input` and
//! `l2tp_input`. Frames the fast path owns are queued and finished by
//! `softintr`; everything else is returned to the caller for the control
//! plane, with sequence numbers already shifted into its view. IP packets
//! from the stack enter through `ip_output`.

pub mod queue;
pub mod registry;
pub mod session;
mod timers;

pub use queue::Target;
pub use registry::SessionHandle;
pub use session::{Session, SessionRequest, SessionState, SessionStats};

use crate::ip;
use crate::ppp::ccp::{self, CcpMessage};
use crate::ppp::{PppFlags, PPP_CCP, PPP_COMP, PPP_IP, PPP_IPV6};
use crate::tunnel::errors::PacketError;
use crate::tunnel::{l2tp, pppoe, pptp, Protocol, Transmit, Tunnel};
use parking_lot::{Condvar, Mutex};
use queue::PacketQueue;
use registry::Registry;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IfaceId(pub u32);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error: pipex is not enabled on this interface")]
    NotEnabled,
    #[error("Error: Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Error: Unsupported tunnel protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("Error: Session already exists")]
    SessionExists,
    #[error("Error: Address {0} is already in use")]
    AddressInUse(IpAddr),
    #[error("Error: No such session")]
    NoSuchSession,
    #[error("Error: Session limit reached")]
    Resource,
    #[error("Error: No such interface")]
    NoSuchInterface,
}

impl Error {
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotEnabled => libc::ENXIO,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::UnsupportedProtocol(_) => libc::EPROTONOSUPPORT,
            Error::SessionExists => libc::EEXIST,
            Error::AddressInUse(_) => libc::EADDRINUSE,
            Error::NoSuchSession => libc::EINVAL,
            Error::Resource => libc::ENOMEM,
            Error::NoSuchInterface => libc::ENODEV,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipexConfig {
    /// Capacity of each packet queue.
    pub queue_len: usize,
    /// Packets taken from each queue per worker run.
    pub dequeue_limit: usize,
    /// Ticks a closing session waits before it is closed for good.
    pub close_timeout: u32,
    pub timer_interval_ms: u64,
    pub max_sessions: usize,
    /// Answer a CCP Reset-Request with a Reset-Ack.
    pub ccp_reset_ack: bool,
    /// Most ppp ids one `get_closed` returns.
    pub max_listreq: usize,
}

impl Default for PipexConfig {
    fn default() -> Self {
        PipexConfig {
            queue_len: 256,
            dequeue_limit: 64,
            close_timeout: 30,
            timer_interval_ms: 1000,
            max_sessions: 65535,
            ccp_reset_ack: true,
            max_listreq: 128,
        }
    }
}

/// What pipex needs from the host network stack.
pub trait NetworkStack: Send + Sync {
    /// Deliver a decapsulated IP packet as if it arrived on `iface`.
    fn ip_input(&self, iface: &str, packet: Vec<u8>) -> io::Result<()>;
    /// Put a tunnel packet on the wire.
    fn transmit(&self, transmit: Transmit) -> io::Result<()>;
    fn link_exists(&self, ifname: &str) -> bool;
}

/// What became of a tunnel packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The fast path took it.
    Consumed,
    /// Hand this to the control plane instead.
    NotOurs(Vec<u8>),
}

#[derive(Debug)]
struct Iface {
    name: String,
    enabled: bool,
}

pub(crate) struct Inner {
    ifaces: HashMap<IfaceId, Iface>,
    next_iface: u32,
    registry: Registry,
    inq: PacketQueue<SessionHandle>,
    outq: PacketQueue<Target>,
    /// Queued packets whose session was destroyed under them.
    dropped: u64,
}

pub struct PipexContext {
    config: PipexConfig,
    inner: Mutex<Inner>,
    stack: Arc<dyn NetworkStack>,
    softintr_pending: Mutex<bool>,
    softintr_cv: Condvar,
}

/// Whether the fast path handles a PPP frame itself.
fn owns_frame(session: &Session, frame: &[u8]) -> bool {
    let (protocol, hlen) = match session.framing().protocol(frame) {
        Ok(p) => p,
        Err(_) => return false,
    };
    match protocol {
        PPP_IP => session.ip_forward,
        PPP_IPV6 => session.ip6_forward,
        PPP_COMP => session.mppe_recv.is_some(),
        PPP_CCP => ccp::is_reset(&frame[hlen..]),
        _ => false,
    }
}

fn ppp_protocol_of(packet: &[u8]) -> u16 {
    match packet.first().map(|b| b >> 4) {
        Some(6) => PPP_IPV6,
        _ => PPP_IP,
    }
}

impl PipexContext {
    pub fn new(config: PipexConfig, stack: Arc<dyn NetworkStack>) -> PipexContext {
        PipexContext {
            inner: Mutex::new(Inner {
                ifaces: HashMap::new(),
                next_iface: 0,
                registry: Registry::new(config.max_sessions),
                inq: PacketQueue::new(config.queue_len),
                outq: PacketQueue::new(config.queue_len),
                dropped: 0,
            }),
            config,
            stack,
            softintr_pending: Mutex::new(false),
            softintr_cv: Condvar::new(),
        }
    }

    pub fn config(&self) -> &PipexConfig {
        &self.config
    }

    /// Register an interface. It starts disabled.
    pub fn iface_init(&self, name: &str) -> IfaceId {
        let mut inner = self.inner.lock();
        let id = IfaceId(inner.next_iface);
        inner.next_iface += 1;
        inner.ifaces.insert(
            id,
            Iface {
                name: name.to_owned(),
                enabled: false,
            },
        );
        id
    }

    /// Destroy every session of `iface` and forget it.
    pub fn iface_shutdown(&self, iface: IfaceId) {
        let mut inner = self.inner.lock();
        Self::destroy_sessions(&mut inner, iface);
        if let Some(removed) = inner.ifaces.remove(&iface) {
            tracing::info!(message = "Info: Interface shut down", iface = %removed.name);
        }
    }

    pub fn set_mode(&self, iface: IfaceId, enabled: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let entry = inner.ifaces.get_mut(&iface).ok_or(Error::NoSuchInterface)?;
        entry.enabled = enabled;
        tracing::info!(message = "Info: Pipex mode changed", iface = %entry.name, enabled);
        if !enabled {
            Self::destroy_sessions(&mut inner, iface);
        }
        Ok(())
    }

    pub fn get_mode(&self, iface: IfaceId) -> Result<bool, Error> {
        let inner = self.inner.lock();
        inner.ifaces.get(&iface).map(|i| i.enabled).ok_or(Error::NoSuchInterface)
    }

    fn destroy_sessions(inner: &mut Inner, iface: IfaceId) {
        for handle in inner.registry.handles() {
            if inner.registry.get(handle).map_or(false, |s| s.iface == iface) {
                inner.registry.remove(handle);
            }
        }
    }

    pub fn add_session(&self, iface: IfaceId, req: &SessionRequest) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        match inner.ifaces.get(&iface) {
            Some(entry) if entry.enabled => {}
            Some(_) => return Err(Error::NotEnabled),
            None => return Err(Error::NoSuchInterface),
        }

        let session = Session::from_request(iface, req, &*self.stack)?;
        let (protocol, session_id, ppp_id) = (session.protocol(), session.session_id, session.ppp_id);
        inner.registry.insert(session)?;
        tracing::info!(message = "Info: Session added", %protocol, session_id, ppp_id);
        Ok(())
    }

    fn lookup(inner: &Inner, protocol: Protocol, session_id: u16) -> Result<SessionHandle, Error> {
        inner
            .registry
            .find_by_id(protocol, session_id)
            .ok_or(Error::NoSuchSession)
    }

    /// Close a session and return its final statistics. Closing a closed
    /// session returns the same statistics again.
    pub fn close_session(&self, protocol: Protocol, session_id: u16) -> Result<SessionStats, Error> {
        let mut inner = self.inner.lock();
        let handle = Self::lookup(&inner, protocol, session_id)?;
        inner.registry.remove_close_wait(handle);

        let session = inner.registry.get_mut(handle).ok_or(Error::NoSuchSession)?;
        if let Some(stats) = session.closed_stats.filter(|_| session.state == SessionState::Closed) {
            return Ok(stats);
        }
        let stats = session.snapshot();
        session.state = SessionState::Closed;
        session.closed_stats = Some(stats);
        tracing::info!(
            message = "Info: Session closed",
            %protocol,
            session_id,
            ppp_id = session.ppp_id
        );
        Ok(stats)
    }

    pub fn config_session(&self, protocol: Protocol, session_id: u16, ip_forward: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let handle = Self::lookup(&inner, protocol, session_id)?;
        let session = inner.registry.get_mut(handle).ok_or(Error::NoSuchSession)?;
        session.ip_forward = ip_forward;
        Ok(())
    }

    pub fn get_stat(&self, protocol: Protocol, session_id: u16) -> Result<SessionStats, Error> {
        let inner = self.inner.lock();
        let handle = Self::lookup(&inner, protocol, session_id)?;
        inner
            .registry
            .get(handle)
            .map(Session::snapshot)
            .ok_or(Error::NoSuchSession)
    }

    pub fn session_state(&self, protocol: Protocol, session_id: u16) -> Result<SessionState, Error> {
        let inner = self.inner.lock();
        let handle = Self::lookup(&inner, protocol, session_id)?;
        inner
            .registry
            .get(handle)
            .map(|s| s.state)
            .ok_or(Error::NoSuchSession)
    }

    /// ppp ids of sessions waiting to be closed on `iface`, and whether
    /// more remain.
    pub fn get_closed(&self, iface: IfaceId) -> Result<(Vec<u32>, bool), Error> {
        let mut inner = self.inner.lock();
        if !inner.ifaces.contains_key(&iface) {
            return Err(Error::NoSuchInterface);
        }

        let (handles, more) = inner
            .registry
            .drain_close_wait(self.config.max_listreq, |s| s.iface == iface);
        let mut ppp_ids = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(session) = inner.registry.get_mut(handle) {
                session.state = SessionState::CloseWait2;
                ppp_ids.push(session.ppp_id);
            }
        }
        Ok((ppp_ids, more))
    }

    pub fn notify_close_session(&self, protocol: Protocol, session_id: u16) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let handle = Self::lookup(&inner, protocol, session_id)?;
        timers::notify_close(&mut inner.registry, handle);
        Ok(())
    }

    pub fn notify_close_session_all(&self) {
        let mut inner = self.inner.lock();
        for handle in inner.registry.handles() {
            timers::notify_close(&mut inner.registry, handle);
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// Packets dropped because their session went away while queued.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Periodic tick, once per `timer_interval_ms`.
    pub fn timer(&self) {
        let mut inner = self.inner.lock();
        timers::sweep(&mut inner, self.config.close_timeout);
    }

    fn schedule(&self) {
        *self.softintr_pending.lock() = true;
        self.softintr_cv.notify_one();
    }

    /// Block until the worker has been scheduled or `timeout` passes.
    /// Returns whether work was scheduled.
    pub fn wait_softintr(&self, timeout: Duration) -> bool {
        let mut pending = self.softintr_pending.lock();
        if !*pending {
            self.softintr_cv.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }

    /// Ethernet frame with ethertype 0x8864 received on `ifname`.
    pub fn pppoe_input(&self, ifname: &str, frame: &[u8]) -> Result<Disposition, PacketError> {
        let mut inner = self.inner.lock();
        let handle = pppoe::lookup_key(frame)
            .ok()
            .and_then(|id| inner.registry.find_by_id(Protocol::Pppoe, id))
            .filter(|h| {
                matches!(inner.registry.get(*h).map(|s| &s.tunnel),
                    Some(Tunnel::Pppoe(p)) if p.over_ifname == ifname)
            });
        match handle {
            Some(handle) => self.tunnel_input(&mut inner, handle, frame),
            None => Ok(Disposition::NotOurs(frame.to_vec())),
        }
    }

    /// IPv4 datagram, header included, carrying GRE.
    pub fn pptp_input(&self, datagram: &[u8]) -> Result<Disposition, PacketError> {
        let mut inner = self.inner.lock();
        let handle = pptp::lookup_key(datagram).ok().and_then(|(src, _, key)| {
            inner
                .registry
                .find_by_id(Protocol::Pptp, key.call_id)
                .filter(|h| {
                    matches!(inner.registry.get(*h).map(|s| &s.tunnel),
                        Some(Tunnel::Pptp(p)) if p.peer_address == src)
                })
        });
        match handle {
            Some(handle) => self.tunnel_input(&mut inner, handle, datagram),
            None => Ok(Disposition::NotOurs(datagram.to_vec())),
        }
    }

    /// UDP payload received from `src` on the local address `dst`. An
    /// unspecified `dst` matches any session local address.
    pub fn l2tp_input(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Disposition, PacketError> {
        let mut inner = self.inner.lock();
        let handle = l2tp::parse_header(payload)
            .ok()
            .filter(|hdr| !hdr.is_control())
            .and_then(|hdr| {
                inner
                    .registry
                    .find_by_id(Protocol::L2tp, hdr.session_id)
                    .filter(|h| {
                        matches!(inner.registry.get(*h).map(|s| &s.tunnel),
                            Some(Tunnel::L2tp(t)) if t.tunnel_id == hdr.tunnel_id
                                && t.peer_address.ip() == src.ip()
                                && (dst.ip().is_unspecified()
                                    || t.local_address.ip().is_unspecified()
                                    || t.local_address.ip() == dst.ip()))
                    })
            });
        match handle {
            Some(handle) => self.tunnel_input(&mut inner, handle, payload),
            None => Ok(Disposition::NotOurs(payload.to_vec())),
        }
    }

    fn tunnel_input(&self, inner: &mut Inner, handle: SessionHandle, packet: &[u8]) -> Result<Disposition, PacketError> {
        let stack = &*self.stack;
        let session = inner.registry.get_mut(handle).ok_or(PacketError::NoSuchSession)?;
        if session.state == SessionState::Closed {
            session.stats.ierrors += 1;
            return Err(PacketError::SessionClosed);
        }

        let ids = session.ids();
        let inbound = match session.tunnel.codec().decode(packet) {
            Ok(inbound) => inbound,
            Err(e) => {
                session.stats.ierrors += 1;
                tracing::debug!(
                    message = "Error: Dropping tunnel packet",
                    protocol = %session.protocol(),
                    session_id = session.session_id,
                    error = ?e
                );
                if e == PacketError::OutOfSequence && session.stateful_mppe_recv() {
                    session.send_ccp_reset_request(stack);
                }
                return Err(e);
            }
        };

        if inbound.send_ack {
            if let Some(ack) = session.tunnel.codec().ack(ids) {
                if let Err(e) = stack.transmit(ack) {
                    tracing::debug!(message = "Error: Failed to send ack", session_id = session.session_id, error = ?e);
                }
            }
        }

        let ours = inbound
            .frame
            .clone()
            .filter(|range| owns_frame(session, &packet[range.clone()]));
        match ours {
            Some(range) => {
                session.tunnel.codec().accept(&inbound);
                if inner.inq.push(handle, packet[range].to_vec()).is_err() {
                    session.stats.ierrors += 1;
                    return Err(PacketError::QueueFull);
                }
                self.schedule();
                Ok(Disposition::Consumed)
            }
            None => {
                let mut packet = packet.to_vec();
                session.tunnel.codec().restore(&inbound, &mut packet);
                Ok(Disposition::NotOurs(packet))
            }
        }
    }

    /// An IP packet the stack routed to `iface`.
    pub fn ip_output(&self, iface: IfaceId, mut packet: Vec<u8>) -> Result<(), PacketError> {
        let dst = ip::dst_address(&packet).ok_or(PacketError::PacketTooShort)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.ifaces.get(&iface).map_or(false, |i| i.enabled) {
            return Err(PacketError::NotForwarding);
        }

        if ip::is_multicast(dst) {
            inner
                .outq
                .push(Target::Multicast(iface), packet)
                .map_err(|_| PacketError::QueueFull)?;
            self.schedule();
            return Ok(());
        }

        let handle = inner
            .registry
            .find_by_address(dst)
            .ok_or(PacketError::NoSuchSession)?;
        let session = inner
            .registry
            .get_mut(handle)
            .filter(|s| s.iface == iface)
            .ok_or(PacketError::NoSuchSession)?;
        if session.state == SessionState::Closed {
            session.stats.oerrors += 1;
            return Err(PacketError::SessionClosed);
        }
        if !session.forwards(dst) {
            session.stats.oerrors += 1;
            return Err(PacketError::NotForwarding);
        }

        if session.timeout_sec != 0 && !ip::is_idle_packet(&packet) {
            session.stats.idle_time = 0;
        }
        if session.flags.contains(PppFlags::ADJUST_TCPMSS) {
            ip::clamp_tcp_mss(&mut packet, session.peer_mru);
        }

        if inner.outq.push(Target::Session(handle), packet).is_err() {
            session.stats.oerrors += 1;
            return Err(PacketError::QueueFull);
        }
        self.schedule();
        Ok(())
    }

    /// Shift a GRE packet written by the control plane for the peer at
    /// `dst` into the wire's sequence space.
    pub fn pptp_userland_output(&self, dst: Ipv4Addr, gre: &mut [u8]) -> Result<(), PacketError> {
        let key = pptp::parse_gre(gre)?;
        let mut inner = self.inner.lock();
        let handle = inner.registry.find_by_peer(dst.into(), |s| {
            s.protocol() == Protocol::Pptp && s.peer_session_id == key.call_id
        });
        match handle.and_then(|h| inner.registry.get_mut(h)) {
            Some(session) => session.tunnel.codec().userland_output(gre),
            None => Ok(()),
        }
    }

    /// Same as `pptp_userland_output` for an L2TP payload sent to `dst`.
    pub fn l2tp_userland_output(&self, dst: SocketAddr, payload: &mut [u8]) -> Result<(), PacketError> {
        let hdr = l2tp::parse_header(payload)?;
        if hdr.is_control() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let handle = inner.registry.find_by_peer(dst.ip(), |s| {
            s.peer_session_id == hdr.session_id
                && matches!(&s.tunnel, Tunnel::L2tp(t) if t.peer_tunnel_id == hdr.tunnel_id)
        });
        match handle.and_then(|h| inner.registry.get_mut(h)) {
            Some(session) => session.tunnel.codec().userland_output(payload),
            None => Ok(()),
        }
    }

    /// Drain both queues, outbound first, up to `dequeue_limit` packets
    /// each. Returns whether work is left.
    pub fn softintr(&self) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for _ in 0..self.config.dequeue_limit {
            match inner.outq.pop() {
                Some((target, packet)) => self.output_dispatch(inner, target, &packet),
                None => break,
            }
        }
        for _ in 0..self.config.dequeue_limit {
            match inner.inq.pop() {
                Some((handle, frame)) => self.ppp_input(inner, handle, frame),
                None => break,
            }
        }

        let more = !(inner.outq.is_empty() && inner.inq.is_empty());
        if more {
            self.schedule();
        }
        more
    }

    fn output_dispatch(&self, inner: &mut Inner, target: Target, packet: &[u8]) {
        let stack = &*self.stack;
        let protocol = ppp_protocol_of(packet);
        match target {
            Target::Session(handle) => match inner.registry.get_mut(handle) {
                None => inner.dropped += 1,
                Some(session) if session.state == SessionState::Closed => session.stats.oerrors += 1,
                Some(session) => session.output(stack, protocol, packet),
            },
            Target::Multicast(iface) => {
                let dst = match ip::dst_address(packet) {
                    Some(dst) => dst,
                    None => return,
                };
                for handle in inner.registry.handles() {
                    if let Some(session) = inner.registry.get_mut(handle) {
                        if session.iface == iface
                            && session.state != SessionState::Closed
                            && session.forwards(dst)
                        {
                            session.output(stack, protocol, packet);
                        }
                    }
                }
            }
        }
    }

    fn ppp_input(&self, inner: &mut Inner, handle: SessionHandle, frame: Vec<u8>) {
        let Inner {
            ifaces,
            registry,
            dropped,
            ..
        } = inner;
        let session = match registry.get_mut(handle) {
            Some(session) => session,
            None => {
                *dropped += 1;
                return;
            }
        };
        if session.state == SessionState::Closed {
            session.stats.ierrors += 1;
            return;
        }

        let iface = ifaces.get(&session.iface).map_or("", |i| i.name.as_str());
        if let Err(e) = self.ppp_dispatch(session, iface, &frame, false) {
            session.stats.ierrors += 1;
            tracing::debug!(
                message = "Error: Dropping PPP frame",
                protocol = %session.protocol(),
                session_id = session.session_id,
                error = ?e
            );
        }
    }

    fn ppp_dispatch(&self, session: &mut Session, iface: &str, frame: &[u8], decrypted: bool) -> Result<(), PacketError> {
        let stack = &*self.stack;
        let (protocol, hlen) = session.framing().protocol(frame)?;
        let payload = &frame[hlen..];

        match protocol {
            PPP_COMP => {
                if decrypted {
                    return Err(PacketError::UnexpectedCompression);
                }
                let mppe = session.mppe_recv.as_mut().ok_or(PacketError::UnexpectedCompression)?;
                match mppe.decrypt(payload) {
                    Ok(plain) => self.ppp_dispatch(session, iface, &plain.frame, true),
                    Err(PacketError::CoherencyMismatch) => {
                        session.send_ccp_reset_request(stack);
                        Err(PacketError::CoherencyMismatch)
                    }
                    Err(e) => Err(e),
                }
            }
            PPP_CCP if decrypted => Err(PacketError::UnexpectedCcp),
            PPP_CCP => self.ccp_input(session, payload),
            PPP_IP | PPP_IPV6 => {
                let forwards = if protocol == PPP_IP {
                    session.ip_forward
                } else {
                    session.ip6_forward
                };
                if !forwards {
                    return Err(PacketError::NotForwarding);
                }
                if !decrypted && session.flags.contains(PppFlags::MPPE_REQUIRED) {
                    return Err(PacketError::EncryptionRequired);
                }
                self.ip_input(session, iface, payload.to_vec())
            }
            _ => Err(PacketError::WrongPacketType),
        }
    }

    fn ccp_input(&self, session: &mut Session, payload: &[u8]) -> Result<(), PacketError> {
        match CcpMessage::parse(payload)? {
            CcpMessage::ResetRequest { id } => {
                let mppe = session.mppe_send.as_mut().ok_or(PacketError::UnexpectedCcp)?;
                mppe.request_reset();
                tracing::debug!(message = "CCP Reset-Request received", session_id = session.session_id, id);
                if self.config.ccp_reset_ack {
                    session.send_ccp_reset_ack(&*self.stack, id);
                }
                Ok(())
            }
            CcpMessage::ResetAck { id } => {
                tracing::debug!(message = "CCP Reset-Ack received", session_id = session.session_id, id);
                Ok(())
            }
            CcpMessage::Other { .. } => Err(PacketError::UnexpectedCcp),
        }
    }

    fn ip_input(&self, session: &mut Session, iface: &str, mut packet: Vec<u8>) -> Result<(), PacketError> {
        let is_v4 = packet.first().map(|b| b >> 4) == Some(4);
        if is_v4 && session.flags.contains(PppFlags::INGRESS_FILTER) {
            let allowed = session
                .ip_address
                .as_ref()
                .map_or(false, |net| ip::ingress_allowed(&packet, net));
            if !allowed {
                return Err(PacketError::IngressFiltered);
            }
        }

        if session.timeout_sec != 0 && !ip::is_idle_packet(&packet) {
            session.stats.idle_time = 0;
        }
        if session.flags.contains(PppFlags::ADJUST_TCPMSS) {
            ip::clamp_tcp_mss(&mut packet, session.peer_mru);
        }

        let len = packet.len() as u64;
        match self.stack.ip_input(iface, packet) {
            Ok(()) => {
                session.stats.ipackets += 1;
                session.stats.ibytes += len;
            }
            Err(e) => {
                session.stats.ierrors += 1;
                tracing::debug!(message = "Error: Stack refused packet", session_id = session.session_id, error = ?e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ppp::mppe::{Mppe, MppeRequest};
    use crate::ppp::{mppe_inner, Framing};
    use etherparse::PacketBuilder;

    /// A network stack that remembers everything handed to it.
    #[derive(Default)]
    pub(crate) struct RecordingStack {
        pub delivered: Mutex<Vec<(String, Vec<u8>)>>,
        pub sent: Mutex<Vec<Transmit>>,
    }

    impl NetworkStack for RecordingStack {
        fn ip_input(&self, iface: &str, packet: Vec<u8>) -> io::Result<()> {
            self.delivered.lock().push((iface.to_owned(), packet));
            Ok(())
        }

        fn transmit(&self, transmit: Transmit) -> io::Result<()> {
            self.sent.lock().push(transmit);
            Ok(())
        }

        fn link_exists(&self, ifname: &str) -> bool {
            ifname.starts_with("eth")
        }
    }

    const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x07];
    const PPTP_PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const PPTP_LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 254);

    fn setup(config: PipexConfig) -> (Arc<RecordingStack>, PipexContext, IfaceId) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let stack = Arc::new(RecordingStack::default());
        let ctx = PipexContext::new(config, stack.clone());
        let iface = ctx.iface_init("pipex0");
        ctx.set_mode(iface, true).unwrap();
        (stack, ctx, iface)
    }

    fn pppoe_request(session_id: u16, addr: [u8; 4]) -> SessionRequest {
        SessionRequest {
            protocol: Protocol::Pppoe as u8,
            session_id,
            peer_session_id: session_id,
            ppp_id: 1000 + session_id as u32,
            peer_mru: 1492,
            over_ifname: Some("eth0".into()),
            peer_mac: Some(PEER_MAC),
            ip_address: Some(addr.into()),
            ..Default::default()
        }
    }

    fn pptp_request() -> SessionRequest {
        SessionRequest {
            protocol: Protocol::Pptp as u8,
            session_id: 10,
            peer_session_id: 20,
            ppp_id: 42,
            peer_address: Some((PPTP_PEER, 0).into()),
            local_address: Some((PPTP_LOCAL, 0).into()),
            ip_address: Some(Ipv4Addr::new(10, 0, 0, 10)),
            snd_una: 1,
            snd_nxt: 1,
            rcv_nxt: 100,
            rcv_acked: 100,
            winsz: 64,
            maxwinsz: 64,
            peer_maxwinsz: 64,
            ..Default::default()
        }
    }

    fn udp_from(src: [u8; 4], dst: [u8; 4], dport: u16) -> Vec<u8> {
        let header = PacketBuilder::ipv4(src, dst, 64).udp(40000, dport);
        let payload = [0xde, 0xad, 0xbe, 0xef];
        let mut packet = Vec::with_capacity(header.size(payload.len()));
        header.write(&mut packet, &payload).unwrap();
        packet
    }

    fn tcp_from(src: [u8; 4], dst: [u8; 4], dport: u16) -> Vec<u8> {
        let header = PacketBuilder::ipv4(src, dst, 64).tcp(40000, dport, 1, 65535).syn();
        let mut packet = Vec::with_capacity(header.size(0));
        header.write(&mut packet, &[]).unwrap();
        packet
    }

    fn pppoe_frame(session_id: u16, ppp: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xfe]);
        f.extend_from_slice(&PEER_MAC);
        f.extend_from_slice(&0x8864u16.to_be_bytes());
        f.extend_from_slice(&[0x11, 0x00]);
        f.extend_from_slice(&session_id.to_be_bytes());
        f.extend_from_slice(&(ppp.len() as u16).to_be_bytes());
        f.extend_from_slice(ppp);
        f
    }

    fn pppoe_framing() -> Framing {
        Framing {
            has_acf: false,
            flags: PppFlags::empty(),
        }
    }

    fn pptp_datagram(seq: u32, ppp: &[u8]) -> Vec<u8> {
        let mut gre = vec![0x30, 0x01, 0x88, 0x0b];
        gre.extend_from_slice(&(ppp.len() as u16).to_be_bytes());
        gre.extend_from_slice(&10u16.to_be_bytes());
        gre.extend_from_slice(&seq.to_be_bytes());
        gre.extend_from_slice(ppp);
        let ip = etherparse::Ipv4Header::new(gre.len() as u16, 64, ip::IPPROTO_GRE, PPTP_PEER.octets(), PPTP_LOCAL.octets());
        let mut out = Vec::new();
        ip.write(&mut out).unwrap();
        out.extend_from_slice(&gre);
        out
    }

    fn with_acf(protocol: u16, payload: &[u8]) -> Vec<u8> {
        Framing {
            has_acf: true,
            flags: PppFlags::empty(),
        }
        .encapsulate(protocol, payload)
    }

    #[test]
    fn pppoe_end_to_end() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 7])).unwrap();

        let inbound_ip = udp_from([10, 0, 0, 7], [198, 51, 100, 1], 443);
        let frame = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &inbound_ip));
        assert_eq!(ctx.pppoe_input("eth0", &frame), Ok(Disposition::Consumed));
        assert!(!ctx.softintr());
        assert_eq!(
            stack.delivered.lock().as_slice(),
            &[("pipex0".to_owned(), inbound_ip.clone())]
        );

        let outbound_ip = udp_from([198, 51, 100, 1], [10, 0, 0, 7], 40000);
        ctx.ip_output(iface, outbound_ip.clone()).unwrap();
        ctx.softintr();
        match stack.sent.lock().first() {
            Some(Transmit::Ethernet {
                ifname,
                dst,
                ethertype,
                payload,
            }) => {
                assert_eq!(ifname, "eth0");
                assert_eq!(*dst, PEER_MAC);
                assert_eq!(*ethertype, 0x8864);
                let len = 2 + outbound_ip.len();
                assert_eq!(&payload[..6], &[0x11, 0x00, 0x00, 0x07, 0x00, len as u8]);
                assert_eq!(&payload[6..8], &[0x00, 0x21]);
                assert_eq!(&payload[8..8 + outbound_ip.len()], outbound_ip.as_slice());
            }
            other => panic!("unexpected transmit {:?}", other),
        }

        let stats = ctx.get_stat(Protocol::Pppoe, 7).unwrap();
        assert_eq!((stats.ipackets, stats.opackets), (1, 1));
        assert_eq!(stats.ibytes, inbound_ip.len() as u64);
    }

    #[test]
    fn pppoe_not_ours() {
        let (_stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 7])).unwrap();

        // LCP belongs to the control plane.
        let lcp = pppoe_frame(7, &pppoe_framing().encapsulate(0xc021, &[9, 1, 0, 8, 0, 0, 0, 0]));
        assert_eq!(ctx.pppoe_input("eth0", &lcp), Ok(Disposition::NotOurs(lcp.clone())));

        // Wrong ingress interface, unknown session.
        let ip = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &udp_from([10, 0, 0, 7], [1, 1, 1, 1], 80)));
        assert!(matches!(ctx.pppoe_input("eth1", &ip), Ok(Disposition::NotOurs(_))));
        let other = pppoe_frame(8, &pppoe_framing().encapsulate(PPP_IP, &udp_from([10, 0, 0, 7], [1, 1, 1, 1], 80)));
        assert!(matches!(ctx.pppoe_input("eth0", &other), Ok(Disposition::NotOurs(_))));
    }

    #[test]
    fn add_session_errors() {
        let (_stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 7])).unwrap();

        let err = ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 8])).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
        let err = ctx.add_session(iface, &pppoe_request(8, [10, 0, 0, 7])).unwrap_err();
        assert_eq!(err.errno(), libc::EADDRINUSE);

        let mut req = pppoe_request(9, [10, 0, 0, 9]);
        req.protocol = 77;
        assert_eq!(ctx.add_session(iface, &req).unwrap_err().errno(), libc::EPROTONOSUPPORT);

        let mut req = pppoe_request(9, [10, 0, 0, 9]);
        req.ip_netmask = Some(Ipv4Addr::new(255, 0, 255, 0));
        assert_eq!(ctx.add_session(iface, &req).unwrap_err().errno(), libc::EINVAL);

        ctx.set_mode(iface, false).unwrap();
        assert_eq!(ctx.session_count(), 0);
        let err = ctx.add_session(iface, &pppoe_request(9, [10, 0, 0, 9])).unwrap_err();
        assert_eq!(err.errno(), libc::ENXIO);
    }

    #[test]
    fn session_limit() {
        let config = PipexConfig {
            max_sessions: 1,
            ..Default::default()
        };
        let (_stack, ctx, iface) = setup(config);
        ctx.add_session(iface, &pppoe_request(1, [10, 0, 0, 1])).unwrap();
        let err = ctx.add_session(iface, &pppoe_request(2, [10, 0, 0, 2])).unwrap_err();
        assert_eq!(err.errno(), libc::ENOMEM);
    }

    #[test]
    fn close_is_idempotent() {
        let (_stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 7])).unwrap();
        let frame = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &udp_from([10, 0, 0, 7], [1, 1, 1, 1], 80)));
        ctx.pppoe_input("eth0", &frame).unwrap();
        ctx.softintr();

        let first = ctx.close_session(Protocol::Pppoe, 7).unwrap();
        assert_eq!(first.ipackets, 1);
        let second = ctx.close_session(Protocol::Pppoe, 7).unwrap();
        assert_eq!(first, second);

        // Closed sessions drop traffic and are reaped by the next tick.
        assert_eq!(ctx.pppoe_input("eth0", &frame), Err(PacketError::SessionClosed));
        ctx.timer();
        assert!(matches!(ctx.get_stat(Protocol::Pppoe, 7), Err(Error::NoSuchSession)));
        assert!(matches!(ctx.close_session(Protocol::Pppoe, 7), Err(Error::NoSuchSession)));
    }

    #[test]
    fn timeout_lifecycle() {
        let (_stack, ctx, iface) = setup(PipexConfig::default());
        let mut req = pppoe_request(7, [10, 0, 0, 7]);
        req.timeout_sec = 5;
        ctx.add_session(iface, &req).unwrap();

        for _ in 0..4 {
            ctx.timer();
        }
        assert_eq!(ctx.get_closed(iface).unwrap(), (vec![], false));
        ctx.timer();
        assert_eq!(ctx.session_state(Protocol::Pppoe, 7).unwrap(), SessionState::CloseWait);
        assert_eq!(ctx.get_closed(iface).unwrap(), (vec![1007], false));
        assert_eq!(ctx.session_state(Protocol::Pppoe, 7).unwrap(), SessionState::CloseWait2);
        assert_eq!(ctx.get_closed(iface).unwrap(), (vec![], false));

        for _ in 0..29 {
            ctx.timer();
        }
        assert_eq!(ctx.session_state(Protocol::Pppoe, 7).unwrap(), SessionState::CloseWait2);
        // Nothing queued, so the close timeout destroys it in the same tick.
        ctx.timer();
        assert!(matches!(ctx.get_stat(Protocol::Pppoe, 7), Err(Error::NoSuchSession)));
        assert_eq!(ctx.session_count(), 0);
    }

    #[test]
    fn queued_packets_delay_destroy() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 7])).unwrap();
        ctx.notify_close_session(Protocol::Pppoe, 7).unwrap();
        for _ in 0..29 {
            ctx.timer();
        }

        let frame = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &udp_from([10, 0, 0, 7], [1, 1, 1, 1], 80)));
        assert_eq!(ctx.pppoe_input("eth0", &frame), Ok(Disposition::Consumed));
        ctx.timer();
        assert_eq!(ctx.session_state(Protocol::Pppoe, 7).unwrap(), SessionState::Closed);
        let closed = ctx.close_session(Protocol::Pppoe, 7).unwrap();
        assert_eq!(closed.ipackets, 0);

        ctx.softintr();
        assert!(stack.delivered.lock().is_empty());
        ctx.timer();
        assert_eq!(ctx.session_count(), 0);
    }

    #[test]
    fn idle_traffic_does_not_keep_session_open() {
        let (_stack, ctx, iface) = setup(PipexConfig::default());
        let mut req = pppoe_request(7, [10, 0, 0, 7]);
        req.timeout_sec = 5;
        ctx.add_session(iface, &req).unwrap();

        for _ in 0..3 {
            ctx.timer();
        }
        let dns = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &udp_from([10, 0, 0, 7], [9, 9, 9, 9], 53)));
        ctx.pppoe_input("eth0", &dns).unwrap();
        ctx.softintr();
        assert_eq!(ctx.get_stat(Protocol::Pppoe, 7).unwrap().idle_time, 3);

        let web = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &tcp_from([10, 0, 0, 7], [9, 9, 9, 9], 80)));
        ctx.pppoe_input("eth0", &web).unwrap();
        ctx.softintr();
        assert_eq!(ctx.get_stat(Protocol::Pppoe, 7).unwrap().idle_time, 0);
    }

    #[test]
    fn notify_close_all() {
        let (_stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(1, [10, 0, 0, 1])).unwrap();
        ctx.add_session(iface, &pppoe_request(2, [10, 0, 0, 2])).unwrap();
        ctx.notify_close_session_all();

        let (mut ids, more) = ctx.get_closed(iface).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1001, 1002]);
        assert!(!more);
    }

    #[test]
    fn get_closed_batches() {
        let config = PipexConfig {
            max_listreq: 2,
            ..Default::default()
        };
        let (_stack, ctx, iface) = setup(config);
        for id in 1..=3 {
            ctx.add_session(iface, &pppoe_request(id, [10, 0, 0, id as u8])).unwrap();
            ctx.notify_close_session(Protocol::Pppoe, id).unwrap();
        }
        let (ids, more) = ctx.get_closed(iface).unwrap();
        assert_eq!(ids, vec![1001, 1002]);
        assert!(more);
        assert_eq!(ctx.get_closed(iface).unwrap(), (vec![1003], false));
    }

    #[test]
    fn multicast_fans_out() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(1, [10, 0, 0, 1])).unwrap();
        ctx.add_session(iface, &pppoe_request(2, [10, 0, 0, 2])).unwrap();
        ctx.add_session(iface, &pppoe_request(3, [10, 0, 0, 3])).unwrap();
        ctx.config_session(Protocol::Pppoe, 3, false).unwrap();

        ctx.ip_output(iface, udp_from([10, 0, 0, 254], [224, 0, 0, 5], 520)).unwrap();
        ctx.softintr();

        let mut ids: Vec<u16> = stack
            .sent
            .lock()
            .iter()
            .map(|t| match t {
                Transmit::Ethernet { payload, .. } => u16::from_be_bytes([payload[2], payload[3]]),
                other => panic!("unexpected transmit {:?}", other),
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn unicast_without_forwarding_is_dropped() {
        let (_stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(1, [10, 0, 0, 1])).unwrap();
        ctx.config_session(Protocol::Pppoe, 1, false).unwrap();
        assert_eq!(
            ctx.ip_output(iface, udp_from([1, 1, 1, 1], [10, 0, 0, 1], 80)),
            Err(PacketError::NotForwarding)
        );
        assert_eq!(ctx.get_stat(Protocol::Pppoe, 1).unwrap().oerrors, 1);
        assert_eq!(
            ctx.ip_output(iface, udp_from([1, 1, 1, 1], [10, 9, 9, 9], 80)),
            Err(PacketError::NoSuchSession)
        );
    }

    #[test]
    fn queue_overflow_counts_errors() {
        let config = PipexConfig {
            queue_len: 1,
            ..Default::default()
        };
        let (_stack, ctx, iface) = setup(config);
        ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 7])).unwrap();
        let frame = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &udp_from([10, 0, 0, 7], [1, 1, 1, 1], 80)));
        ctx.pppoe_input("eth0", &frame).unwrap();
        assert_eq!(ctx.pppoe_input("eth0", &frame), Err(PacketError::QueueFull));
        assert_eq!(ctx.get_stat(Protocol::Pppoe, 7).unwrap().ierrors, 1);
    }

    #[test]
    fn destroyed_session_drops_queued_packets() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pppoe_request(7, [10, 0, 0, 7])).unwrap();
        let frame = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &udp_from([10, 0, 0, 7], [1, 1, 1, 1], 80)));
        ctx.pppoe_input("eth0", &frame).unwrap();
        ctx.iface_shutdown(iface);
        ctx.softintr();
        assert_eq!(ctx.dropped(), 1);
        assert!(stack.delivered.lock().is_empty());
    }

    #[test]
    fn pptp_sequence_handling() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pptp_request()).unwrap();
        let ip = udp_from([10, 0, 0, 10], [1, 1, 1, 1], 443);

        assert_eq!(ctx.pptp_input(&pptp_datagram(100, &with_acf(PPP_IP, &ip))), Ok(Disposition::Consumed));
        // One behind the edge still goes through.
        assert_eq!(ctx.pptp_input(&pptp_datagram(100, &with_acf(PPP_IP, &ip))), Ok(Disposition::Consumed));
        // Far behind is dropped.
        assert_eq!(
            ctx.pptp_input(&pptp_datagram(30, &with_acf(PPP_IP, &ip))),
            Err(PacketError::OutOfSequence)
        );
        ctx.softintr();
        assert_eq!(stack.delivered.lock().len(), 2);
        assert_eq!(ctx.get_stat(Protocol::Pptp, 10).unwrap().ierrors, 1);

        // LCP goes to userland with its sequence number shifted back by the
        // one packet the fast path kept.
        let lcp = with_acf(0xc021, &[9, 1, 0, 8, 0, 0, 0, 0]);
        match ctx.pptp_input(&pptp_datagram(101, &lcp)).unwrap() {
            Disposition::NotOurs(packet) => {
                assert_eq!(u32::from_be_bytes([packet[28], packet[29], packet[30], packet[31]]), 100);
            }
            Disposition::Consumed => panic!("LCP must not be consumed"),
        }

        // Unknown peer address is not ours at all.
        let mut foreign = pptp_datagram(102, &with_acf(PPP_IP, &ip));
        foreign[12] = 203;
        assert_eq!(ctx.pptp_input(&foreign), Ok(Disposition::NotOurs(foreign.clone())));
    }

    #[test]
    fn pptp_output_and_userland_rewrite() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &pptp_request()).unwrap();
        ctx.ip_output(iface, udp_from([1, 1, 1, 1], [10, 0, 0, 10], 443)).unwrap();
        ctx.softintr();
        match stack.sent.lock().first() {
            Some(Transmit::Ipv4 { dst, datagram }) => {
                assert_eq!(*dst, PPTP_PEER);
                assert_eq!(datagram[9], ip::IPPROTO_GRE);
                assert_eq!(&datagram[26..28], &20u16.to_be_bytes());
            }
            other => panic!("unexpected transmit {:?}", other),
        }

        // The control plane still numbers from 1; the fast path used 1.
        let mut gre = vec![0x30, 0x01, 0x88, 0x0b, 0, 0, 0, 20];
        gre.extend_from_slice(&1u32.to_be_bytes());
        ctx.pptp_userland_output(PPTP_PEER, &mut gre).unwrap();
        assert_eq!(&gre[8..12], &2u32.to_be_bytes());
    }

    #[test]
    fn l2tp_input_and_control() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        let req = SessionRequest {
            protocol: Protocol::L2tp as u8,
            session_id: 5,
            peer_session_id: 6,
            tunnel_id: 1,
            peer_tunnel_id: 2,
            peer_address: Some("192.0.2.1:1701".parse().unwrap()),
            local_address: Some("192.0.2.254:1701".parse().unwrap()),
            ip_address: Some(Ipv4Addr::new(10, 0, 0, 5)),
            ..Default::default()
        };
        ctx.add_session(iface, &req).unwrap();
        let src: SocketAddr = "192.0.2.1:1701".parse().unwrap();
        let dst: SocketAddr = "192.0.2.254:1701".parse().unwrap();

        let ip = udp_from([10, 0, 0, 5], [1, 1, 1, 1], 443);
        let mut data = vec![0x00, 0x02, 0x00, 0x01, 0x00, 0x05];
        data.extend_from_slice(&with_acf(PPP_IP, &ip));
        assert_eq!(ctx.l2tp_input(src, dst, &data), Ok(Disposition::Consumed));
        ctx.softintr();
        assert_eq!(stack.delivered.lock().len(), 1);

        let control = [0xc8, 0x02, 0x00, 0x0c, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(ctx.l2tp_input(src, dst, &control), Ok(Disposition::NotOurs(control.to_vec())));

        // Same ids from another peer.
        let other: SocketAddr = "198.51.100.9:1701".parse().unwrap();
        assert!(matches!(ctx.l2tp_input(other, dst, &data), Ok(Disposition::NotOurs(_))));
    }

    fn mppe_request(key: u8) -> MppeRequest {
        MppeRequest {
            stateless: false,
            keylenbits: 128,
            master_key: [key; 16],
        }
    }

    fn mppe_session(required: bool) -> SessionRequest {
        let mut req = pppoe_request(7, [10, 0, 0, 7]);
        req.ppp_flags = PppFlags::MPPE_ENABLED | PppFlags::MPPE_ACCEPTED;
        if required {
            req.ppp_flags.insert(PppFlags::MPPE_REQUIRED);
        }
        req.mppe_send = Some(mppe_request(0x11));
        req.mppe_recv = Some(mppe_request(0x22));
        req
    }

    fn ethernet_payload(t: &Transmit) -> &[u8] {
        match t {
            Transmit::Ethernet { payload, .. } => {
                let len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
                &payload[6..6 + len]
            }
            other => panic!("unexpected transmit {:?}", other),
        }
    }

    #[test]
    fn mppe_both_directions() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &mppe_session(true)).unwrap();

        // The peer encrypts with our receive key.
        let mut peer_send = Mppe::new(&mppe_request(0x22), false).unwrap();
        let ip = udp_from([10, 0, 0, 7], [1, 1, 1, 1], 443);
        let sealed = peer_send.encrypt(&mppe_inner(PPP_IP, &ip));
        let frame = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_COMP, &sealed));
        assert_eq!(ctx.pppoe_input("eth0", &frame), Ok(Disposition::Consumed));
        ctx.softintr();
        assert_eq!(stack.delivered.lock()[0].1, ip);

        // Plain IP is refused while encryption is required.
        let plain = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_IP, &ip));
        ctx.pppoe_input("eth0", &plain).unwrap();
        ctx.softintr();
        assert_eq!(stack.delivered.lock().len(), 1);
        assert_eq!(ctx.get_stat(Protocol::Pppoe, 7).unwrap().ierrors, 1);

        // And decrypts what we send with our send key.
        let reply = udp_from([1, 1, 1, 1], [10, 0, 0, 7], 40000);
        ctx.ip_output(iface, reply.clone()).unwrap();
        ctx.softintr();
        let sent = stack.sent.lock();
        let ppp = ethernet_payload(&sent[0]);
        assert_eq!(&ppp[..2], &PPP_COMP.to_be_bytes());
        let mut peer_recv = Mppe::new(&mppe_request(0x11), false).unwrap();
        let opened = peer_recv.decrypt(&ppp[2..]).unwrap();
        assert_eq!(opened.frame, mppe_inner(PPP_IP, &reply));
    }

    #[test]
    fn ccp_reset_request_is_acked_and_flushes() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &mppe_session(false)).unwrap();

        let reset = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_CCP, &[14, 5, 0, 4]));
        assert_eq!(ctx.pppoe_input("eth0", &reset), Ok(Disposition::Consumed));
        ctx.softintr();

        ctx.ip_output(iface, udp_from([1, 1, 1, 1], [10, 0, 0, 7], 40000)).unwrap();
        ctx.softintr();

        let sent = stack.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(ethernet_payload(&sent[0]), &[0x80, 0xfd, 15, 5, 0, 4]);
        let data = ethernet_payload(&sent[1]);
        assert_eq!(&data[..2], &PPP_COMP.to_be_bytes());
        assert_ne!(data[2] & 0x80, 0, "first packet after a reset is flushed");
    }

    #[test]
    fn coherency_gap_requests_reset() {
        let (stack, ctx, iface) = setup(PipexConfig::default());
        ctx.add_session(iface, &mppe_session(false)).unwrap();

        let mut peer_send = Mppe::new(&mppe_request(0x22), false).unwrap();
        let ip = udp_from([10, 0, 0, 7], [1, 1, 1, 1], 443);
        // Lose the first frame.
        peer_send.encrypt(&mppe_inner(PPP_IP, &ip));
        let sealed = peer_send.encrypt(&mppe_inner(PPP_IP, &ip));
        let frame = pppoe_frame(7, &pppoe_framing().encapsulate(PPP_COMP, &sealed));
        ctx.pppoe_input("eth0", &frame).unwrap();
        ctx.softintr();

        assert!(stack.delivered.lock().is_empty());
        let sent = stack.sent.lock();
        assert_eq!(ethernet_payload(&sent[0]), &[0x80, 0xfd, 14, 0, 0, 4]);
    }

    #[test]
    fn config_defaults_from_json() {
        let config: PipexConfig = serde_json::from_str(r#"{"queue_len": 16}"#).unwrap();
        assert_eq!(config.queue_len, 16);
        assert_eq!(config.close_timeout, 30);
        assert!(config.ccp_reset_ack);
    }
}
