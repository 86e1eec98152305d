// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Microsoft Point-to-Point Encryption, one direction per [`Mppe`].
//!
//! Every encrypted frame carries a two byte header: the "flushed" bit
//! (0x8000), the "encrypted" bit (0x1000) and a 12-bit coherency counter.
//! Both ends derive the next session key from the master key at the same
//! counter values, so a receiver can replay the rotations it missed.

use super::rc4::Rc4;
use crate::tunnel::errors::PacketError;
use ring::digest::{Context, SHA1_FOR_LEGACY_USE_ONLY};
use zeroize::Zeroize;

pub const MPPE_HEADER_LEN: usize = 2;
pub const MPPE_KEY_LEN: usize = 16;

const COHERENCY_MASK: u16 = 0x0fff;
const FLAG_FLUSHED: u16 = 0x8000;
const FLAG_ENCRYPTED: u16 = 0x1000;

/// A counter further ahead than this is taken as a late packet rather
/// than as loss. It also bounds how many rotations a single packet can
/// cost the receiver.
const REORDER_THRESHOLD: u16 = 0x0f00;
const LOSS_LOG_THRESHOLD: u32 = 1000;

/// Session keys kept for late packets in stateless mode.
pub const OLD_KEYS: usize = 64;

const SHA_PAD1: [u8; 40] = [0x00; 40];
const SHA_PAD2: [u8; 40] = [0xf2; 40];

/// Key material handed over by the control plane for one direction.
#[derive(Clone, Debug, Default)]
pub struct MppeRequest {
    pub stateless: bool,
    /// 40, 56 or 128.
    pub keylenbits: u16,
    pub master_key: [u8; MPPE_KEY_LEN],
}

impl Drop for MppeRequest {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

#[derive(Clone, Copy, Default)]
struct OldKey {
    coher_cnt: Option<u16>,
    key: [u8; MPPE_KEY_LEN],
}

pub struct Mppe {
    stateless: bool,
    keylenbits: u16,
    keylen: usize,
    master_key: [u8; MPPE_KEY_LEN],
    session_key: [u8; MPPE_KEY_LEN],
    coher_cnt: u16,
    rc4: Rc4,
    resetreq: bool,
    old_keys: Option<Box<[OldKey; OLD_KEYS]>>,
}

/// Result of a successful decrypt.
#[derive(Debug)]
pub struct Decrypted {
    pub frame: Vec<u8>,
    /// Frames the counter says were lost before this one.
    pub lost: u32,
}

fn new_key_from_sha(start_key: &[u8], session_key: &[u8], out: &mut [u8]) {
    let mut ctx = Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(start_key);
    ctx.update(&SHA_PAD1);
    ctx.update(session_key);
    ctx.update(&SHA_PAD2);
    let digest = ctx.finish();
    out.copy_from_slice(&digest.as_ref()[..out.len()]);
}

impl Mppe {
    /// Set up one direction. `keep_old_keys` enables the late packet ring,
    /// which only makes sense for a stateless receiver.
    pub fn new(req: &MppeRequest, keep_old_keys: bool) -> Result<Mppe, &'static str> {
        let keylen = match req.keylenbits {
            40 | 56 => 8,
            128 => 16,
            _ => return Err("Error: MPPE key length must be 40, 56 or 128 bits"),
        };

        let mut session_key = [0u8; MPPE_KEY_LEN];
        new_key_from_sha(
            &req.master_key[..keylen],
            &req.master_key[..keylen],
            &mut session_key[..keylen],
        );

        let mut mppe = Mppe {
            stateless: req.stateless,
            keylenbits: req.keylenbits,
            keylen,
            master_key: req.master_key,
            session_key,
            coher_cnt: 0,
            rc4: Rc4::new(&session_key[..keylen]),
            resetreq: false,
            old_keys: if keep_old_keys && req.stateless {
                Some(Box::new([OldKey::default(); OLD_KEYS]))
            } else {
                None
            },
        };
        mppe.reduce_key();
        mppe.rc4 = Rc4::new(mppe.key());
        session_key.zeroize();

        Ok(mppe)
    }

    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    pub fn keylenbits(&self) -> u16 {
        self.keylenbits
    }

    pub fn coherency_count(&self) -> u16 {
        self.coher_cnt
    }

    /// The next outbound frame will be flushed.
    pub fn request_reset(&mut self) {
        self.resetreq = true;
    }

    pub fn reset_requested(&self) -> bool {
        self.resetreq
    }

    fn key(&self) -> &[u8] {
        &self.session_key[..self.keylen]
    }

    fn reduce_key(&mut self) {
        match self.keylenbits {
            40 => {
                self.session_key[0] = 0xd1;
                self.session_key[1] = 0x26;
                self.session_key[2] = 0x9e;
            }
            56 => self.session_key[0] = 0xd1,
            _ => {}
        }
    }

    fn key_change(&mut self) {
        let keylen = self.keylen;
        let mut interim = [0u8; MPPE_KEY_LEN];
        new_key_from_sha(
            &self.master_key[..keylen],
            &self.session_key[..keylen],
            &mut interim[..keylen],
        );

        let mut keychg = Rc4::new(&interim[..keylen]);
        keychg.process(&mut interim[..keylen]);
        self.session_key[..keylen].copy_from_slice(&interim[..keylen]);
        interim.zeroize();

        self.reduce_key();
    }

    /// Encrypt an inner PPP frame (protocol field plus payload) and return
    /// the MPPE header followed by the ciphertext.
    pub fn encrypt(&mut self, inner: &[u8]) -> Vec<u8> {
        let mut flushed = false;

        if self.stateless {
            flushed = true;
            self.key_change();
        } else if self.coher_cnt & 0xff == 0xff {
            flushed = true;
            self.key_change();
        } else if self.resetreq {
            flushed = true;
            self.resetreq = false;
        }

        if flushed {
            self.rc4 = Rc4::new(self.key());
        }

        let mut header = self.coher_cnt | FLAG_ENCRYPTED;
        if flushed {
            header |= FLAG_FLUSHED;
        }
        self.coher_cnt = (self.coher_cnt + 1) & COHERENCY_MASK;

        let mut out = Vec::with_capacity(MPPE_HEADER_LEN + inner.len());
        out.extend_from_slice(&header.to_be_bytes());
        out.extend_from_slice(inner);
        self.rc4.process(&mut out[MPPE_HEADER_LEN..]);
        out
    }

    /// Decrypt a frame carried in a PPP COMP packet. On
    /// `CoherencyMismatch` the caller should send a CCP Reset-Request.
    pub fn decrypt(&mut self, packet: &[u8]) -> Result<Decrypted, PacketError> {
        if packet.len() < MPPE_HEADER_LEN {
            return Err(PacketError::PacketTooShort);
        }

        let header = u16::from_be_bytes([packet[0], packet[1]]);
        let mut flushed = header & FLAG_FLUSHED != 0;
        let coher_cnt = header & COHERENCY_MASK;
        if header & FLAG_ENCRYPTED == 0 {
            return Err(PacketError::NotEncrypted);
        }

        let ahead = coher_cnt.wrapping_sub(self.coher_cnt) & COHERENCY_MASK;
        if ahead > REORDER_THRESHOLD {
            return self.decrypt_late(coher_cnt, &packet[MPPE_HEADER_LEN..]);
        }

        let mut lost = 0u32;
        if self.stateless {
            self.key_change();
            while self.coher_cnt != coher_cnt {
                self.key_change();
                self.coher_cnt = (self.coher_cnt + 1) & COHERENCY_MASK;
                lost += 1;
            }
            self.remember_key(coher_cnt);
            flushed = true;
        } else {
            if flushed {
                lost = ahead as u32;
                // One rotation for every 256 boundary the sender crossed.
                let from = self.coher_cnt / 256;
                let to = (self.coher_cnt + ahead) / 256;
                for _ in from..to {
                    self.key_change();
                }
                self.coher_cnt = coher_cnt;
            } else if self.coher_cnt != coher_cnt {
                return Err(PacketError::CoherencyMismatch);
            }
            if coher_cnt & 0xff == 0xff {
                self.key_change();
                flushed = true;
            }
        }

        if lost > LOSS_LOG_THRESHOLD {
            tracing::debug!(message = "MPPE packet loss", lost);
        }

        if flushed {
            self.rc4 = Rc4::new(self.key());
        }

        let mut frame = packet[MPPE_HEADER_LEN..].to_vec();
        self.rc4.process(&mut frame);
        self.coher_cnt = (self.coher_cnt + 1) & COHERENCY_MASK;

        Ok(Decrypted { frame, lost })
    }

    fn remember_key(&mut self, coher_cnt: u16) {
        let key = self.session_key;
        if let Some(ring) = self.old_keys.as_mut() {
            ring[coher_cnt as usize % OLD_KEYS] = OldKey {
                coher_cnt: Some(coher_cnt),
                key,
            };
        }
    }

    fn decrypt_late(&self, coher_cnt: u16, payload: &[u8]) -> Result<Decrypted, PacketError> {
        let keylen = self.keylen;
        let old = self
            .old_keys
            .as_ref()
            .map(|ring| ring[coher_cnt as usize % OLD_KEYS])
            .filter(|old| old.coher_cnt == Some(coher_cnt))
            .ok_or(PacketError::CoherencyOutOfRange)?;

        let mut frame = payload.to_vec();
        Rc4::new(&old.key[..keylen]).process(&mut frame);
        Ok(Decrypted { frame, lost: 0 })
    }
}

impl Drop for Mppe {
    fn drop(&mut self) {
        self.master_key.zeroize();
        self.session_key.zeroize();
        if let Some(ring) = self.old_keys.as_mut() {
            for old in ring.iter_mut() {
                old.key.zeroize();
            }
        }
    }
}

impl std::fmt::Debug for Mppe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mppe")
            .field("stateless", &self.stateless)
            .field("keylenbits", &self.keylenbits)
            .field("coher_cnt", &self.coher_cnt)
            .field("resetreq", &self.resetreq)
            .finish_non_exhaustive()
    }
}
