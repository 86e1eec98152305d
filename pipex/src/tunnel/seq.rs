// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Serial number arithmetic for the GRE (32-bit) and L2TP (16-bit)
//! sequence spaces.

/// How far behind the receive edge a packet may be and still be delivered.
pub const REWIND_LIMIT: u32 = 64;

#[inline]
pub fn seq32_sub(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[inline]
pub fn seq32_lt(a: u32, b: u32) -> bool {
    seq32_sub(a, b) < 0
}

#[inline]
pub fn seq32_gt(a: u32, b: u32) -> bool {
    seq32_sub(a, b) > 0
}

#[inline]
pub fn seq32_ge(a: u32, b: u32) -> bool {
    seq32_sub(a, b) >= 0
}

#[inline]
pub fn seq16_sub(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

#[inline]
pub fn seq16_lt(a: u16, b: u16) -> bool {
    seq16_sub(a, b) < 0
}

#[inline]
pub fn seq16_gt(a: u16, b: u16) -> bool {
    seq16_sub(a, b) > 0
}

#[inline]
pub fn seq16_le(a: u16, b: u16) -> bool {
    seq16_sub(a, b) <= 0
}

#[inline]
pub fn seq16_ge(a: u16, b: u16) -> bool {
    seq16_sub(a, b) >= 0
}

/// Where an incoming sequence number lands relative to the receive edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqPosition {
    /// At or after the edge. Carries how many numbers it advances the edge by.
    Advance(u32),
    /// Behind the edge but within `REWIND_LIMIT`.
    Rewind,
    /// Too far behind.
    Stale,
}

/// Classify `seq` against `rcv_nxt`, the next number we expect.
pub fn classify32(seq: u32, rcv_nxt: u32) -> SeqPosition {
    if seq32_lt(seq, rcv_nxt) {
        if seq32_lt(seq, rcv_nxt.wrapping_sub(REWIND_LIMIT)) {
            SeqPosition::Stale
        } else {
            SeqPosition::Rewind
        }
    } else {
        SeqPosition::Advance(seq.wrapping_add(1).wrapping_sub(rcv_nxt))
    }
}

pub fn classify16(seq: u16, rcv_nxt: u16) -> SeqPosition {
    if seq16_lt(seq, rcv_nxt) {
        if seq16_lt(seq, rcv_nxt.wrapping_sub(REWIND_LIMIT as u16)) {
            SeqPosition::Stale
        } else {
            SeqPosition::Rewind
        }
    } else {
        SeqPosition::Advance(seq.wrapping_add(1).wrapping_sub(rcv_nxt) as u32)
    }
}
