// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use super::errors::PacketError;
use super::{frame_range, Inbound, SessionIds, Transmit, TunnelCodec};
use crate::ppp::PPP_MIN_LEN;

pub const ETHER_HEADER_LEN: usize = 14;
pub const ETHER_MIN_PAYLOAD: usize = 46;
pub const ETHERTYPE_PPPOE_SESSION: u16 = 0x8864;

pub const PPPOE_HEADER_LEN: usize = 6;
pub const PPPOE_VERTYPE: u8 = 0x11;
pub const PPPOE_CODE_SESSION: u8 = 0x00;

// Offsets inside the PPPoE header
const VERTYPE_OFF: usize = 0;
const CODE_OFF: usize = 1;
const SESSION_ID_OFF: usize = 2;
const LENGTH_OFF: usize = 4;

/// PPPoE session state: where the peer is, nothing else. PPPoE has no
/// sequence numbers.
#[derive(Debug, Clone)]
pub struct PppoeSession {
    pub over_ifname: String,
    pub peer_mac: [u8; 6],
}

/// Session id of an Ethernet frame carrying PPPoE session data.
pub fn lookup_key(frame: &[u8]) -> Result<u16, PacketError> {
    if frame.len() < ETHER_HEADER_LEN + PPPOE_HEADER_LEN {
        return Err(PacketError::PacketTooShort);
    }
    let hdr = &frame[ETHER_HEADER_LEN..];
    Ok(u16::from_be_bytes([hdr[SESSION_ID_OFF], hdr[SESSION_ID_OFF + 1]]))
}

impl PppoeSession {
    pub fn new(over_ifname: String, peer_mac: [u8; 6]) -> PppoeSession {
        PppoeSession { over_ifname, peer_mac }
    }
}

impl TunnelCodec for PppoeSession {
    fn decode(&mut self, frame: &[u8]) -> Result<Inbound, PacketError> {
        if frame.len() < ETHER_HEADER_LEN + PPPOE_HEADER_LEN {
            return Err(PacketError::PacketTooShort);
        }
        let hdr = &frame[ETHER_HEADER_LEN..];
        if hdr[VERTYPE_OFF] != PPPOE_VERTYPE {
            return Err(PacketError::WrongVersion);
        }
        if hdr[CODE_OFF] != PPPOE_CODE_SESSION {
            return Err(PacketError::WrongPacketType);
        }

        let len = u16::from_be_bytes([hdr[LENGTH_OFF], hdr[LENGTH_OFF + 1]]) as usize;
        if len < PPP_MIN_LEN {
            return Err(PacketError::IncorrectPacketLength);
        }

        // Anything past the PPPoE length is Ethernet padding.
        Ok(Inbound {
            frame: Some(frame_range(ETHER_HEADER_LEN + PPPOE_HEADER_LEN, len, frame)?),
            ..Default::default()
        })
    }

    fn encode(&mut self, ids: SessionIds, frame: &[u8]) -> Transmit {
        let mut payload = Vec::with_capacity((PPPOE_HEADER_LEN + frame.len()).max(ETHER_MIN_PAYLOAD));
        payload.push(PPPOE_VERTYPE);
        payload.push(PPPOE_CODE_SESSION);
        payload.extend_from_slice(&ids.session_id.to_be_bytes());
        payload.extend_from_slice(&(frame.len() as u16).to_be_bytes());
        payload.extend_from_slice(frame);
        if payload.len() < ETHER_MIN_PAYLOAD {
            payload.resize(ETHER_MIN_PAYLOAD, 0);
        }

        Transmit::Ethernet {
            ifname: self.over_ifname.clone(),
            dst: self.peer_mac,
            ethertype: ETHERTYPE_PPPOE_SESSION,
            payload,
        }
    }

    fn has_acf(&self) -> bool {
        false
    }
}
