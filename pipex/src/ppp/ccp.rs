// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The two Compression Control Protocol messages the fast path handles.
//! Everything else in CCP belongs to the control plane.

use crate::tunnel::errors::PacketError;

pub const CCP_RESETREQ: u8 = 14;
pub const CCP_RESETACK: u8 = 15;

const CCP_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcpMessage {
    ResetRequest { id: u8 },
    ResetAck { id: u8 },
    Other { code: u8, id: u8 },
}

impl CcpMessage {
    pub fn parse(packet: &[u8]) -> Result<CcpMessage, PacketError> {
        if packet.len() < CCP_HEADER_LEN {
            return Err(PacketError::PacketTooShort);
        }

        let (code, id) = (packet[0], packet[1]);
        Ok(match code {
            CCP_RESETREQ => CcpMessage::ResetRequest { id },
            CCP_RESETACK => CcpMessage::ResetAck { id },
            _ => CcpMessage::Other { code, id },
        })
    }

    /// Code and identifier followed by a length of four: these messages
    /// never carry data.
    pub fn encode(&self) -> [u8; CCP_HEADER_LEN] {
        let (code, id) = match *self {
            CcpMessage::ResetRequest { id } => (CCP_RESETREQ, id),
            CcpMessage::ResetAck { id } => (CCP_RESETACK, id),
            CcpMessage::Other { code, id } => (code, id),
        };
        let len = (CCP_HEADER_LEN as u16).to_be_bytes();
        [code, id, len[0], len[1]]
    }
}

/// Whether a CCP packet should stay on the fast path. Only looks at the
/// code byte so it can run before the frame is queued.
pub fn is_reset(packet: &[u8]) -> bool {
    matches!(packet.first(), Some(&CCP_RESETREQ) | Some(&CCP_RESETACK))
}
