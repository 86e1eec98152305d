// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! L2TPv2 data messages over UDP.
//!
//! ```text
//! |T|L|x|x|S|x|O|P|x|x|x|x|  Ver  |          Length (opt)         |
//! |           Tunnel ID           |           Session ID          |
//! |             Ns (opt)          |             Nr (opt)          |
//! |      Offset Size (opt)        |    Offset pad... (opt)        |
//! ```
//!
//! Nr carries the next sequence number the sender expects.

use super::errors::PacketError;
use super::seq::{classify16, seq16_gt, seq16_le, seq16_sub, SeqPosition};
use super::{frame_range, Inbound, SeqField, SessionIds, Transmit, TunnelCodec};
use crate::ppp::PPP_MIN_LEN;
use std::net::SocketAddr;

pub const L2TP_PORT: u16 = 1701;

const FLAG_TYPE: u16 = 0x8000;
const FLAG_LENGTH: u16 = 0x4000;
const FLAG_SEQUENCE: u16 = 0x0800;
const FLAG_OFFSET: u16 = 0x0200;
const VERSION_MASK: u16 = 0x000f;
const VERSION: u16 = 2;

#[derive(Debug, Clone)]
pub struct L2tpSession {
    pub local_address: SocketAddr,
    pub peer_address: SocketAddr,
    pub tunnel_id: u16,
    pub peer_tunnel_id: u16,
    pub ns_una: u16,
    pub ns_nxt: u16,
    pub nr_nxt: u16,
    pub nr_acked: u16,
    pub winsz: u16,
    pub ns_gap: u16,
    pub nr_gap: u16,
    pub ul_ns_una: u16,
    /// Data messages we send carry Ns/Nr.
    pub sequencing: bool,
}

/// The fixed part of an L2TP header plus where its optional fields sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2tpHeader {
    pub flags: u16,
    pub length: Option<u16>,
    pub tunnel_id: u16,
    pub session_id: u16,
    /// Offset of Ns, when the S bit is set. Nr follows it.
    pub seq_offset: Option<usize>,
    /// Offset of the PPP frame.
    pub payload_offset: usize,
}

impl L2tpHeader {
    pub fn is_control(&self) -> bool {
        self.flags & FLAG_TYPE != 0
    }
}

fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn put16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

pub fn parse_header(packet: &[u8]) -> Result<L2tpHeader, PacketError> {
    if packet.len() < 6 {
        return Err(PacketError::PacketTooShort);
    }
    let flags = be16(packet, 0);
    if flags & VERSION_MASK != VERSION {
        return Err(PacketError::WrongVersion);
    }

    let mut off = 2;
    let length = if flags & FLAG_LENGTH != 0 {
        off += 2;
        Some(be16(packet, 2))
    } else {
        None
    };

    if packet.len() < off + 4 {
        return Err(PacketError::PacketTooShort);
    }
    let tunnel_id = be16(packet, off);
    let session_id = be16(packet, off + 2);
    off += 4;

    let seq_offset = if flags & FLAG_SEQUENCE != 0 {
        if packet.len() < off + 4 {
            return Err(PacketError::PacketTooShort);
        }
        off += 4;
        Some(off - 4)
    } else {
        None
    };

    if flags & FLAG_OFFSET != 0 {
        if packet.len() < off + 2 {
            return Err(PacketError::PacketTooShort);
        }
        off += 2 + be16(packet, off) as usize;
    }

    Ok(L2tpHeader {
        flags,
        length,
        tunnel_id,
        session_id,
        seq_offset,
        payload_offset: off,
    })
}

impl L2tpSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_address: SocketAddr,
        peer_address: SocketAddr,
        tunnel_id: u16,
        peer_tunnel_id: u16,
        ns_una: u16,
        ns_nxt: u16,
        nr_nxt: u16,
        nr_acked: u16,
        winsz: u16,
        sequencing: bool,
    ) -> L2tpSession {
        L2tpSession {
            local_address,
            peer_address,
            tunnel_id,
            peer_tunnel_id,
            ns_una,
            ns_nxt,
            nr_nxt,
            nr_acked,
            winsz,
            ns_gap: 0,
            nr_gap: 0,
            ul_ns_una: ns_una,
            sequencing,
        }
    }

    fn build(&mut self, ids: SessionIds, frame: &[u8], zlb: bool) -> Transmit {
        let hlen = 8 + if self.sequencing { 4 } else { 0 };
        let mut payload = vec![0u8; hlen + frame.len()];

        let mut flags = FLAG_LENGTH | VERSION;
        let len = payload.len() as u16;
        put16(&mut payload, 2, len);
        put16(&mut payload, 4, self.peer_tunnel_id);
        put16(&mut payload, 6, ids.peer_session_id);
        if self.sequencing {
            flags |= FLAG_SEQUENCE;
            put16(&mut payload, 8, self.ns_nxt);
            if !zlb {
                self.ns_nxt = self.ns_nxt.wrapping_add(1);
                self.ns_gap = self.ns_gap.wrapping_add(1);
            }
            self.nr_acked = self.nr_nxt;
            put16(&mut payload, 10, self.nr_nxt);
        }
        put16(&mut payload, 0, flags);
        payload[hlen..].copy_from_slice(frame);

        Transmit::Udp {
            src: self.local_address,
            dst: self.peer_address,
            payload,
        }
    }
}

impl TunnelCodec for L2tpSession {
    fn decode(&mut self, packet: &[u8]) -> Result<Inbound, PacketError> {
        let hdr = parse_header(packet)?;
        let mut inbound = Inbound::default();
        if hdr.is_control() {
            return Ok(inbound);
        }

        let end = match hdr.length {
            Some(len) if (len as usize) > packet.len() => return Err(PacketError::IncorrectPacketLength),
            Some(len) => len as usize,
            None => packet.len(),
        };
        if end < hdr.payload_offset + PPP_MIN_LEN {
            return Err(PacketError::IncorrectPacketLength);
        }
        inbound.frame = Some(frame_range(hdr.payload_offset, end - hdr.payload_offset, packet)?);

        let off = match hdr.seq_offset {
            Some(off) => off,
            None => return Ok(inbound),
        };
        let ns = be16(packet, off);
        let nr = be16(packet, off + 2);
        inbound.seq = Some(SeqField {
            offset: off,
            value: ns as u32,
        });
        inbound.ack = Some(SeqField {
            offset: off + 2,
            value: nr as u32,
        });

        if seq16_gt(nr, self.ns_una) && seq16_le(nr, self.ns_nxt) {
            self.ns_una = nr;
        }

        match classify16(ns, self.nr_nxt) {
            SeqPosition::Stale => {
                tracing::debug!(
                    message = "Error: L2TP data out of sequence",
                    ns,
                    nr_nxt = self.nr_nxt
                );
                return Err(PacketError::OutOfSequence);
            }
            SeqPosition::Rewind => inbound.rewind = true,
            SeqPosition::Advance(nseq) => {
                inbound.advance = nseq;
                self.nr_nxt = ns.wrapping_add(1);
            }
        }

        let half_window = ((self.winsz as i32 + 1) & !1) / 2;
        inbound.send_ack = seq16_sub(self.nr_nxt, self.nr_acked) as i32 > half_window;
        Ok(inbound)
    }

    fn accept(&mut self, inbound: &Inbound) {
        if !inbound.rewind {
            self.nr_gap = self.nr_gap.wrapping_add(inbound.advance as u16);
        }
    }

    fn restore(&mut self, inbound: &Inbound, packet: &mut [u8]) {
        if let Some(ns) = inbound.seq {
            put16(packet, ns.offset, (ns.value as u16).wrapping_sub(self.nr_gap));
        }
        if let Some(nr) = inbound.ack {
            if self.ns_nxt == self.ns_una {
                self.ul_ns_una = (nr.value as u16).wrapping_sub(self.ns_gap);
            }
            put16(packet, nr.offset, self.ul_ns_una);
        }
    }

    fn encode(&mut self, ids: SessionIds, frame: &[u8]) -> Transmit {
        self.build(ids, frame, false)
    }

    fn ack(&mut self, ids: SessionIds) -> Option<Transmit> {
        self.sequencing.then(|| self.build(ids, &[], true))
    }

    fn userland_output(&mut self, packet: &mut [u8]) -> Result<(), PacketError> {
        let hdr = parse_header(packet)?;
        if hdr.is_control() {
            return Ok(());
        }
        if let Some(off) = hdr.seq_offset {
            let ns = be16(packet, off).wrapping_add(self.ns_gap);
            put16(packet, off, ns);
            self.ns_nxt = self.ns_nxt.wrapping_add(1);

            let nr = be16(packet, off + 2).wrapping_add(self.nr_gap);
            put16(packet, off + 2, nr);
            if seq16_gt(nr, self.nr_acked) {
                self.nr_acked = nr;
            }
        }
        Ok(())
    }
}
