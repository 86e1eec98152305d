// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Line based control protocol on `<sock_dir>/<iface>.sock`.
//!
//! A request is one command line, optionally followed by `key=value` lines
//! and a blank line. The reply is zero or more `key=value` lines followed by
//! `errno=N` and a blank line.

use super::Error;
use crate::context::{IfaceId, PipexContext, SessionRequest, SessionStats};
use crate::ppp::mppe::MppeRequest;
use crate::ppp::PppFlags;
use crate::serialization::KeyBytes;
use crate::tunnel::Protocol;
use libc::*;
use std::fs::{create_dir_all, remove_file};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Bind the control socket and serve it from a new thread until `exit`
/// is raised or the socket file disappears.
pub(super) fn spawn_listener(
    sock_dir: &str,
    ctx: Arc<PipexContext>,
    iface: IfaceId,
    iface_name: &str,
    exit: Arc<AtomicBool>,
) -> Result<(PathBuf, JoinHandle<()>), Error> {
    let _ = create_dir_all(sock_dir);
    let path = Path::new(sock_dir).join(format!("{}.sock", iface_name));
    let _ = remove_file(&path);

    let listener = UnixListener::bind(&path).map_err(Error::ApiSocket)?;
    listener.set_nonblocking(true).map_err(Error::ApiSocket)?;

    let monitored = path.clone();
    let handle = thread::spawn(move || {
        while !exit.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((conn, _)) => {
                    if conn.set_nonblocking(false).is_err() {
                        continue;
                    }
                    let mut reader = BufReader::new(&conn);
                    let mut writer = BufWriter::new(&conn);
                    if let Err(e) = serve(&ctx, iface, &mut reader, &mut writer) {
                        tracing::debug!(message = "Error: API connection failed", error = ?e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Removing the socket file is a request to stop.
                    if !monitored.exists() {
                        tracing::info!(message = "Info: Control socket removed, exiting");
                        exit.store(true, Ordering::Relaxed);
                        break;
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!(message = "Error: API accept failed", error = ?e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    });

    Ok((path, handle))
}

/// Handle one request from `reader` and write the reply to `writer`.
pub fn serve<R: BufRead, W: Write>(
    ctx: &PipexContext,
    iface: IfaceId,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<()> {
    let mut cmd = String::new();
    if reader.read_line(&mut cmd)? == 0 {
        return Ok(());
    }
    let cmd = cmd.trim_end_matches('\n');

    let status = match cmd.split_once('=') {
        Some(("get_mode", _)) => api_get_mode(writer, ctx, iface),
        Some(("set_mode", value)) => match value.parse::<bool>() {
            Ok(enabled) => status_of(ctx.set_mode(iface, enabled)),
            Err(_) => EINVAL,
        },
        Some(("add_session", "1")) => match read_block(reader) {
            Ok(block) => match session_request(&block) {
                Ok(req) => status_of(ctx.add_session(iface, &req)),
                Err(errno) => errno,
            },
            Err(errno) => errno,
        },
        Some(("close_session", "1")) => with_session(reader, |protocol, id, _| {
            ctx.close_session(protocol, id)
                .map(|stats| write_stats(writer, &stats))
        }),
        Some(("get_stat", "1")) => with_session(reader, |protocol, id, _| {
            ctx.get_stat(protocol, id).map(|stats| write_stats(writer, &stats))
        }),
        Some(("config_session", "1")) => with_session(reader, |protocol, id, block| {
            match lookup(block, "ip_forward").map(str::parse::<bool>) {
                Some(Ok(forward)) => ctx.config_session(protocol, id, forward),
                _ => Err(crate::context::Error::InvalidArgument("ip_forward")),
            }
        }),
        Some(("notify_close", "1")) => with_session(reader, |protocol, id, _| ctx.notify_close_session(protocol, id)),
        Some(("notify_close_all", "1")) => {
            ctx.notify_close_session_all();
            0
        }
        Some(("get_closed", "1")) => match ctx.get_closed(iface) {
            Ok((ppp_ids, more)) => {
                for ppp_id in ppp_ids {
                    writeln!(writer, "ppp_id={}", ppp_id)?;
                }
                writeln!(writer, "more={}", more)?;
                0
            }
            Err(e) => e.errno(),
        },
        _ => EIO,
    };

    writeln!(writer, "errno={}\n", status)?;
    writer.flush()
}

fn status_of(result: Result<(), crate::context::Error>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!(message = "Error: Control request failed", error = %e);
            e.errno()
        }
    }
}

#[allow(unused_must_use)]
fn api_get_mode<W: Write>(writer: &mut W, ctx: &PipexContext, iface: IfaceId) -> i32 {
    match ctx.get_mode(iface) {
        Ok(enabled) => {
            writeln!(writer, "mode={}", enabled);
            0
        }
        Err(e) => e.errno(),
    }
}

#[allow(unused_must_use)]
fn write_stats<W: Write>(writer: &mut W, stats: &SessionStats) {
    writeln!(writer, "ipackets={}", stats.ipackets);
    writeln!(writer, "ierrors={}", stats.ierrors);
    writeln!(writer, "ibytes={}", stats.ibytes);
    writeln!(writer, "opackets={}", stats.opackets);
    writeln!(writer, "oerrors={}", stats.oerrors);
    writeln!(writer, "obytes={}", stats.obytes);
    writeln!(writer, "idle_time={}", stats.idle_time);
}

/// Read `key=value` lines up to a blank line or end of input.
fn read_block<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>, i32> {
    let mut block = vec![];
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(block),
            Ok(_) => {}
            Err(_) => return Err(EIO),
        }
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            return Ok(block);
        }
        match line.split_once('=') {
            Some((key, value)) => block.push((key.to_owned(), value.to_owned())),
            None => return Err(EPROTO),
        }
    }
}

fn lookup<'a>(block: &'a [(String, String)], key: &str) -> Option<&'a str> {
    block.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// Read a block naming a session by `protocol` and `session_id`, then run
/// `f` on it.
fn with_session<R, F>(reader: &mut R, f: F) -> i32
where
    R: BufRead,
    F: FnOnce(Protocol, u16, &[(String, String)]) -> Result<(), crate::context::Error>,
{
    let block = match read_block(reader) {
        Ok(block) => block,
        Err(errno) => return errno,
    };
    let protocol = match lookup(&block, "protocol").map(str::parse::<Protocol>) {
        Some(Ok(protocol)) => protocol,
        Some(Err(_)) => return EPROTONOSUPPORT,
        None => return EINVAL,
    };
    let session_id = match lookup(&block, "session_id").map(str::parse::<u16>) {
        Some(Ok(id)) => id,
        _ => return EINVAL,
    };
    status_of(f(protocol, session_id, &block))
}

fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = value.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then(|| mac)
}

fn mppe_key<'a>(req: &'a mut Option<MppeRequest>) -> &'a mut MppeRequest {
    req.get_or_insert_with(|| {
        let mut key = MppeRequest::default();
        key.keylenbits = 128;
        key
    })
}

/// Build a session request from an `add_session` block.
fn session_request(block: &[(String, String)]) -> Result<SessionRequest, i32> {
    let mut req = SessionRequest::default();

    for (option, value) in block {
        let value = value.as_str();
        match option.as_str() {
            "protocol" => match value.parse::<Protocol>() {
                Ok(protocol) => req.protocol = protocol as u8,
                Err(_) => match value.parse::<u8>() {
                    Ok(number) => req.protocol = number,
                    Err(_) => return Err(EPROTONOSUPPORT),
                },
            },
            "session_id" => req.session_id = value.parse().map_err(|_| EINVAL)?,
            "peer_session_id" => req.peer_session_id = value.parse().map_err(|_| EINVAL)?,
            "ppp_id" => req.ppp_id = value.parse().map_err(|_| EINVAL)?,
            "ppp_flag" => match PppFlags::from_name(value) {
                Some(flag) => req.ppp_flags.insert(flag),
                None => return Err(EINVAL),
            },
            "peer_mru" => req.peer_mru = value.parse().map_err(|_| EINVAL)?,
            "timeout_sec" => req.timeout_sec = value.parse().map_err(|_| EINVAL)?,
            "ip_address" => req.ip_address = Some(value.parse().map_err(|_| EINVAL)?),
            "ip_netmask" => req.ip_netmask = Some(value.parse().map_err(|_| EINVAL)?),
            "ip6_network" => req.ip6_network = Some(value.parse().map_err(|_| EINVAL)?),
            "ip_forward" => req.ip_forward = Some(value.parse().map_err(|_| EINVAL)?),
            "ip6_forward" => req.ip6_forward = Some(value.parse().map_err(|_| EINVAL)?),
            "local_address" => req.local_address = Some(value.parse().map_err(|_| EINVAL)?),
            "peer_address" => req.peer_address = Some(value.parse().map_err(|_| EINVAL)?),
            "snd_una" => req.snd_una = value.parse().map_err(|_| EINVAL)?,
            "snd_nxt" => req.snd_nxt = value.parse().map_err(|_| EINVAL)?,
            "rcv_nxt" => req.rcv_nxt = value.parse().map_err(|_| EINVAL)?,
            "rcv_acked" => req.rcv_acked = value.parse().map_err(|_| EINVAL)?,
            "winsz" => req.winsz = value.parse().map_err(|_| EINVAL)?,
            "maxwinsz" => req.maxwinsz = value.parse().map_err(|_| EINVAL)?,
            "peer_maxwinsz" => req.peer_maxwinsz = value.parse().map_err(|_| EINVAL)?,
            "tunnel_id" => req.tunnel_id = value.parse().map_err(|_| EINVAL)?,
            "peer_tunnel_id" => req.peer_tunnel_id = value.parse().map_err(|_| EINVAL)?,
            "l2tp_sequencing" => req.l2tp_sequencing = value.parse().map_err(|_| EINVAL)?,
            "over_ifname" => req.over_ifname = Some(value.to_owned()),
            "peer_mac" => req.peer_mac = Some(parse_mac(value).ok_or(EINVAL)?),
            "mppe_send_key" => match value.parse::<KeyBytes>() {
                Ok(key) => mppe_key(&mut req.mppe_send).master_key = key.0,
                Err(_) => return Err(EINVAL),
            },
            "mppe_recv_key" => match value.parse::<KeyBytes>() {
                Ok(key) => mppe_key(&mut req.mppe_recv).master_key = key.0,
                Err(_) => return Err(EINVAL),
            },
            "mppe_send_keylen" => mppe_key(&mut req.mppe_send).keylenbits = value.parse().map_err(|_| EINVAL)?,
            "mppe_recv_keylen" => mppe_key(&mut req.mppe_recv).keylenbits = value.parse().map_err(|_| EINVAL)?,
            "mppe_send_stateless" => mppe_key(&mut req.mppe_send).stateless = value.parse().map_err(|_| EINVAL)?,
            "mppe_recv_stateless" => mppe_key(&mut req.mppe_recv).stateless = value.parse().map_err(|_| EINVAL)?,
            _ => return Err(EINVAL),
        }
    }
    Ok(req)
}
