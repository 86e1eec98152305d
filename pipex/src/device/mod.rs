// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Linux runtime: wires a `PipexContext` to a TUN interface and to the
//! sockets its tunnels arrive on, and serves the control socket.

pub mod api;
pub mod packet;
pub mod relay;

#[path = "tun_linux.rs"]
pub mod tun;

use crate::context::{Disposition, IfaceId, NetworkStack, PipexConfig, PipexContext};
use crate::tunnel::errors::PacketError;
use crate::tunnel::pppoe::ETHERTYPE_PPPOE_SESSION;
use crate::tunnel::{Protocol, Transmit};
use packet::PacketSocket;
use relay::Relay;
use serde::Deserialize;
use socket2::{Domain, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tun::TunSocket;

const MAX_PACKET_SIZE: usize = (1 << 16) - 1;
const READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    Socket(io::Error),
    #[error("{0}")]
    Bind(String),
    #[error("{0}")]
    IOCtl(io::Error),
    #[error("Error: Invalid tunnel name")]
    InvalidTunnelName,
    #[error("interface read: {0}")]
    IfaceRead(io::Error),
    #[error("API socket error: {0}")]
    ApiSocket(io::Error),
    #[error("relay socket error: {0}")]
    RelaySocket(io::Error),
    #[error("Error: Malformed relay frame: {0}")]
    Relay(&'static str),
    #[error("Error: Packet rejected: {0:?}")]
    Packet(PacketError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub pipex: PipexConfig,
    /// Enable the fast path as soon as the interface exists.
    pub start_enabled: bool,
    pub l2tp: bool,
    pub l2tp_port: u16,
    pub pptp: bool,
    /// Links to receive PPPoE session frames on.
    pub pppoe_interfaces: Vec<String>,
    pub sock_dir: String,
    /// Unix datagram socket of the control plane, for packets the fast
    /// path does not keep.
    pub relay_path: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            pipex: PipexConfig::default(),
            start_enabled: true,
            l2tp: true,
            l2tp_port: 1701,
            pptp: true,
            pppoe_interfaces: vec![],
            sock_dir: "/var/run/pipex".to_owned(),
            relay_path: None,
        }
    }
}

/// Wait until `fd` is readable. Returns false on timeout.
pub(crate) fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    if ret < 0 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(e);
    }
    Ok(ret > 0)
}

fn not_enabled(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{} is not enabled", what))
}

/// The host side of pipex on Linux.
pub struct LinuxStack {
    tun: Arc<TunSocket>,
    gre: Option<Arc<Socket>>,
    udp4: Option<Arc<UdpSocket>>,
    udp6: Option<Arc<UdpSocket>>,
    pppoe: Option<PacketSocket>,
}

impl NetworkStack for LinuxStack {
    fn ip_input(&self, _iface: &str, packet: Vec<u8>) -> io::Result<()> {
        self.tun.write(&packet).map(drop)
    }

    fn transmit(&self, transmit: Transmit) -> io::Result<()> {
        match transmit {
            Transmit::Ethernet {
                ifname,
                dst,
                ethertype,
                payload,
            } => {
                let sock = self.pppoe.as_ref().ok_or_else(|| not_enabled("PPPoE"))?;
                sock.send_to(&ifname, dst, ethertype, &payload).map(drop)
            }
            Transmit::Ipv4 { dst, datagram } => {
                let sock = self.gre.as_ref().ok_or_else(|| not_enabled("PPTP"))?;
                sock.send_to(&datagram, &SocketAddrV4::new(dst, 0).into()).map(drop)
            }
            Transmit::Udp { dst, payload, .. } => {
                let sock = match dst {
                    SocketAddr::V4(_) => self.udp4.as_ref(),
                    SocketAddr::V6(_) => self.udp6.as_ref(),
                };
                sock.ok_or_else(|| not_enabled("L2TP"))?.send_to(&payload, dst).map(drop)
            }
        }
    }

    fn link_exists(&self, ifname: &str) -> bool {
        packet::ifindex(ifname).is_some()
    }
}

fn open_gre() -> Result<Socket, Error> {
    let sock = Socket::new(Domain::IPV4, Type::RAW, Some(libc::IPPROTO_GRE.into())).map_err(Error::Socket)?;
    // We write whole datagrams, header included.
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Socket(io::Error::last_os_error()));
    }
    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    Ok(sock)
}

fn open_udp(addr: SocketAddr) -> Result<UdpSocket, Error> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(socket2::Protocol::UDP)).map_err(Error::Socket)?;
    sock.set_reuse_address(true)?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    sock.bind(&addr.into())
        .map_err(|e| Error::Bind(format!("Error: Failed to bind {}: {}", addr, e)))?;
    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    Ok(sock.into())
}

struct Runtime {
    ctx: Arc<PipexContext>,
    stack: Arc<LinuxStack>,
    iface: IfaceId,
    relay: Option<Arc<Relay>>,
    exit: Arc<AtomicBool>,
}

impl Runtime {
    fn running(&self) -> bool {
        !self.exit.load(Ordering::Relaxed)
    }

    fn handle(&self, protocol: Protocol, address: &str, result: Result<Disposition, PacketError>) {
        match result {
            Ok(Disposition::Consumed) => {}
            Ok(Disposition::NotOurs(packet)) => match &self.relay {
                Some(relay) => relay.forward(protocol, address, &packet),
                None => tracing::trace!(message = "Dropping control packet, no relay", %protocol),
            },
            Err(e) => tracing::trace!(message = "Error: Tunnel packet dropped", %protocol, error = ?e),
        }
    }

    fn worker(&self) {
        while self.running() {
            self.ctx.wait_softintr(READ_TIMEOUT);
            while self.ctx.softintr() {}
        }
    }

    fn timer(&self) {
        let interval = Duration::from_millis(self.ctx.config().timer_interval_ms);
        while self.running() {
            thread::sleep(interval);
            self.ctx.timer();
        }
    }

    fn tun_reader(&self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while self.running() {
            match self.stack.tun.read_timeout(&mut buf, READ_TIMEOUT) {
                Ok(Some(packet)) => {
                    if let Err(e) = self.ctx.ip_output(self.iface, packet.to_vec()) {
                        tracing::trace!(message = "Error: Outbound packet dropped", error = ?e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(message = "Error: Failed read on tun interface", error = ?e);
                    self.exit.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn gre_reader(&self, sock: &Socket) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while self.running() {
            let n = match (&*sock).read(&mut buf) {
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
                Err(e) => {
                    tracing::warn!(message = "Error: GRE socket read failed", error = ?e);
                    continue;
                }
            };
            let datagram = &buf[..n];
            let src = match crate::ip::src_address(datagram) {
                Some(src) => src.to_string(),
                None => continue,
            };
            self.handle(Protocol::Pptp, &src, self.ctx.pptp_input(datagram));
        }
    }

    fn udp_reader(&self, sock: &UdpSocket) {
        let local = match sock.local_addr() {
            Ok(local) => local,
            Err(_) => return,
        };
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while self.running() {
            match sock.recv_from(&mut buf) {
                Ok((n, src)) => {
                    let result = self.ctx.l2tp_input(src, local, &buf[..n]);
                    self.handle(Protocol::L2tp, &src.to_string(), result);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => tracing::warn!(message = "Error: L2TP socket read failed", error = ?e),
            }
        }
    }

    fn pppoe_reader(&self, ifname: &str, sock: &PacketSocket) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while self.running() {
            match sock.recv_timeout(&mut buf, READ_TIMEOUT) {
                Ok(Some(n)) => self.handle(Protocol::Pppoe, ifname, self.ctx.pppoe_input(ifname, &buf[..n])),
                Ok(None) => {}
                Err(e) => tracing::warn!(message = "Error: PPPoE socket read failed", ifname, error = ?e),
            }
        }
    }

    fn relay_reader(&self, relay: &Relay) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while self.running() {
            match relay.recv(&mut buf) {
                Ok(Some(n)) => Relay::transmit(&*self.stack, &self.ctx, &buf[..n]),
                Ok(None) => {}
                Err(e) => tracing::warn!(message = "Error: Relay socket read failed", error = ?e),
            }
        }
    }
}

/// Turn the fast path on for a freshly created interface. Returns whether
/// it is now enabled.
fn enable(ctx: &PipexContext, iface: IfaceId, name: &str) -> bool {
    match ctx.set_mode(iface, true) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(message = "Error: Failed to enable pipex", iface = %name, error = ?e);
            false
        }
    }
}

fn spawn<F>(runtime: &Arc<Runtime>, f: F) -> JoinHandle<()>
where
    F: FnOnce(&Runtime) + Send + 'static,
{
    let rt = Arc::clone(runtime);
    thread::spawn(move || f(&rt))
}

pub struct DeviceHandle {
    ctx: Arc<PipexContext>,
    iface: IfaceId,
    exit: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    cleanup_paths: Vec<PathBuf>,
}

impl DeviceHandle {
    pub fn new(tunname: &str, config: &DeviceConfig) -> Result<DeviceHandle, Error> {
        let tun = Arc::new(TunSocket::new(tunname)?);
        let gre = if config.pptp { Some(Arc::new(open_gre()?)) } else { None };
        let (udp4, udp6) = if config.l2tp {
            let v4 = open_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.l2tp_port).into())?;
            let v6 = open_udp(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config.l2tp_port, 0, 0).into())
                .map_err(|e| tracing::warn!(message = "Error: No IPv6 L2TP socket", error = %e))
                .ok();
            (Some(Arc::new(v4)), v6.map(Arc::new))
        } else {
            (None, None)
        };
        let pppoe_rx = config
            .pppoe_interfaces
            .iter()
            .map(|ifname| {
                PacketSocket::bind(ifname, ETHERTYPE_PPPOE_SESSION)
                    .map(|sock| (ifname.clone(), sock))
                    .map_err(|e| Error::Bind(format!("Error: Failed to bind PPPoE on {}: {}", ifname, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let pppoe = if pppoe_rx.is_empty() {
            None
        } else {
            Some(PacketSocket::sender().map_err(Error::Socket)?)
        };

        let stack = Arc::new(LinuxStack {
            tun: Arc::clone(&tun),
            gre: gre.clone(),
            udp4: udp4.clone(),
            udp6: udp6.clone(),
            pppoe,
        });
        let ctx = Arc::new(PipexContext::new(config.pipex.clone(), stack.clone()));
        let iface = ctx.iface_init(tun.name());
        if config.start_enabled {
            enable(&ctx, iface, tun.name());
        }

        let mut cleanup_paths = vec![];
        let relay = match &config.relay_path {
            Some(peer) => {
                let ours = PathBuf::from(&config.sock_dir).join(format!("{}.relay", tun.name()));
                let _ = std::fs::create_dir_all(&config.sock_dir);
                let relay = Relay::bind(ours, Some(PathBuf::from(peer)))?;
                cleanup_paths.push(relay.path().clone());
                Some(Arc::new(relay))
            }
            None => None,
        };

        let exit = Arc::new(AtomicBool::new(false));
        let runtime = Arc::new(Runtime {
            ctx: Arc::clone(&ctx),
            stack,
            iface,
            relay: relay.clone(),
            exit: Arc::clone(&exit),
        });

        let mut threads = vec![
            spawn(&runtime, |rt| rt.worker()),
            spawn(&runtime, |rt| rt.timer()),
            spawn(&runtime, |rt| rt.tun_reader()),
        ];
        if let Some(gre) = gre {
            threads.push(spawn(&runtime, move |rt| rt.gre_reader(&gre)));
        }
        for udp in udp4.into_iter().chain(udp6) {
            threads.push(spawn(&runtime, move |rt| rt.udp_reader(&udp)));
        }
        for (ifname, sock) in pppoe_rx {
            threads.push(spawn(&runtime, move |rt| rt.pppoe_reader(&ifname, &sock)));
        }
        if let Some(relay) = relay {
            threads.push(spawn(&runtime, move |rt| rt.relay_reader(&relay)));
        }

        let (api_path, api_thread) =
            api::spawn_listener(&config.sock_dir, Arc::clone(&ctx), iface, tun.name(), Arc::clone(&exit))?;
        cleanup_paths.push(api_path);
        threads.push(api_thread);

        tracing::info!(
            message = "Info: Pipex device started",
            iface = tun.name(),
            pptp = config.pptp,
            l2tp = config.l2tp,
            pppoe = config.pppoe_interfaces.len()
        );

        Ok(DeviceHandle {
            ctx,
            iface,
            exit,
            threads,
            cleanup_paths,
        })
    }

    pub fn context(&self) -> &Arc<PipexContext> {
        &self.ctx
    }

    pub fn trigger_exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    pub fn wait(&mut self) {
        while let Some(thread) = self.threads.pop() {
            if thread.join().is_err() {
                tracing::error!(message = "Error: Device thread panicked");
            }
        }
    }

    pub fn clean(&mut self) {
        for path in &self.cleanup_paths {
            // try to remove any file we created in the work dir
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.trigger_exit();
        self.ctx.iface_shutdown(self.iface);
        self.clean();
    }
}
