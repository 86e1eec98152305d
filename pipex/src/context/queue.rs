// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use super::registry::SessionHandle;
use super::IfaceId;
use std::collections::VecDeque;

/// Who an outbound packet is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Session(SessionHandle),
    /// Every forwarding session on the interface.
    Multicast(IfaceId),
}

/// Bounded FIFO between the packet entry points and the worker.
#[derive(Debug)]
pub struct PacketQueue<T> {
    items: VecDeque<(T, Vec<u8>)>,
    limit: usize,
}

impl<T> PacketQueue<T> {
    pub fn new(limit: usize) -> PacketQueue<T> {
        PacketQueue {
            items: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    /// Append a packet. A full queue hands it back.
    pub fn push(&mut self, target: T, packet: Vec<u8>) -> Result<(), Vec<u8>> {
        if self.items.len() >= self.limit {
            return Err(packet);
        }
        self.items.push_back((target, packet));
        Ok(())
    }

    pub fn pop(&mut self) -> Option<(T, Vec<u8>)> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
