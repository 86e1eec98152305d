// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A fast path for PPP sessions carried over PPPoE, PPTP (GRE) and L2TP.
//!
//! The control plane negotiates sessions in userland and registers them
//! here; from then on data frames are decapsulated, decrypted and handed
//! to the host stack without leaving the fast path, and IP packets routed
//! to a session go back out the same way. Everything the fast path does
//! not own is returned to the control plane unchanged, apart from the
//! sequence numbers it has to keep consistent.
#[cfg(all(feature = "device", target_os = "linux"))]
pub mod device;

pub mod context;
pub mod ip;
pub mod ppp;
pub mod tunnel;

pub mod serialization;

pub use context::{
    Disposition, Error, IfaceId, NetworkStack, PipexConfig, PipexContext, SessionRequest, SessionState, SessionStats,
};
pub use tunnel::{Protocol, Transmit};
