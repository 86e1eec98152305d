// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! PPP framing as the tunnels carry it: an optional address/control field
//! followed by a one or two byte protocol number.

pub mod ccp;
pub mod mppe;
pub mod rc4;

use crate::tunnel::errors::PacketError;
use std::ops::BitOr;

pub const PPP_ALLSTATIONS: u8 = 0xff;
pub const PPP_UI: u8 = 0x03;

pub const PPP_IP: u16 = 0x0021;
pub const PPP_IPV6: u16 = 0x0057;
pub const PPP_COMP: u16 = 0x00fd;
pub const PPP_CCP: u16 = 0x80fd;

/// Shortest PPP frame worth looking at: ACF, two byte protocol, one byte.
pub const PPP_MIN_LEN: usize = 5;

/// Options the control plane negotiated for a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PppFlags(u32);

impl PppFlags {
    pub const ACFC_ACCEPTED: PppFlags = PppFlags(0x0001);
    pub const PFC_ACCEPTED: PppFlags = PppFlags(0x0002);
    pub const ACFC_ENABLED: PppFlags = PppFlags(0x0004);
    pub const PFC_ENABLED: PppFlags = PppFlags(0x0008);
    pub const MPPE_ACCEPTED: PppFlags = PppFlags(0x0010);
    pub const MPPE_ENABLED: PppFlags = PppFlags(0x0020);
    pub const MPPE_REQUIRED: PppFlags = PppFlags(0x0040);
    pub const ADJUST_TCPMSS: PppFlags = PppFlags(0x0100);
    pub const INGRESS_FILTER: PppFlags = PppFlags(0x0200);

    const NAMES: [(&'static str, PppFlags); 9] = [
        ("acfc_accepted", PppFlags::ACFC_ACCEPTED),
        ("pfc_accepted", PppFlags::PFC_ACCEPTED),
        ("acfc_enabled", PppFlags::ACFC_ENABLED),
        ("pfc_enabled", PppFlags::PFC_ENABLED),
        ("mppe_accepted", PppFlags::MPPE_ACCEPTED),
        ("mppe_enabled", PppFlags::MPPE_ENABLED),
        ("mppe_required", PppFlags::MPPE_REQUIRED),
        ("adjust_tcpmss", PppFlags::ADJUST_TCPMSS),
        ("ingress_filter", PppFlags::INGRESS_FILTER),
    ];

    pub const fn empty() -> PppFlags {
        PppFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> PppFlags {
        PppFlags(bits & 0x037f)
    }

    pub const fn contains(self, other: PppFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PppFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PppFlags) {
        self.0 &= !other.0;
    }

    /// Flag by its control socket name.
    pub fn from_name(name: &str) -> Option<PppFlags> {
        PppFlags::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
    }
}

impl BitOr for PppFlags {
    type Output = PppFlags;

    fn bitor(self, rhs: PppFlags) -> PppFlags {
        PppFlags(self.0 | rhs.0)
    }
}

/// How a session frames PPP. PPPoE never carries the address/control field.
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    pub has_acf: bool,
    pub flags: PppFlags,
}

impl Framing {
    /// Read the protocol number at the head of `frame`. Returns the
    /// protocol and the length of the PPP header.
    pub fn protocol(&self, frame: &[u8]) -> Result<(u16, usize), PacketError> {
        let mut off = 0;
        if self.has_acf
            && frame.len() >= 2
            && frame[0] == PPP_ALLSTATIONS
            && frame[1] == PPP_UI
        {
            off = 2;
        }

        let first = *frame.get(off).ok_or(PacketError::PacketTooShort)?;
        if first & 0x01 != 0 {
            // Compressed protocol field, only legal if the peer was told it may.
            if !self.flags.contains(PppFlags::PFC_ACCEPTED) {
                return Err(PacketError::BrokenPppHeader);
            }
            return Ok((first as u16, off + 1));
        }

        let second = *frame.get(off + 1).ok_or(PacketError::PacketTooShort)?;
        Ok((u16::from_be_bytes([first, second]), off + 2))
    }

    /// Prepend the PPP header for `protocol` to `payload`.
    pub fn encapsulate(&self, protocol: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 4);
        if self.has_acf && !self.flags.contains(PppFlags::ACFC_ENABLED) {
            frame.extend_from_slice(&[PPP_ALLSTATIONS, PPP_UI]);
        }
        if self.flags.contains(PppFlags::PFC_ENABLED) && protocol <= 0xff {
            frame.push(protocol as u8);
        } else {
            frame.extend_from_slice(&protocol.to_be_bytes());
        }
        frame.extend_from_slice(payload);
        frame
    }
}

/// The frame MPPE encrypts: always a full two byte protocol, never an ACF.
pub fn mppe_inner(protocol: u16, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(payload.len() + 2);
    inner.extend_from_slice(&protocol.to_be_bytes());
    inner.extend_from_slice(payload);
    inner
}
