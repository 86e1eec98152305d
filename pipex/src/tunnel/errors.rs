// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

/// Reasons a packet is dropped on the fast path. These never leave the
/// process; they are logged and counted against the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    PacketTooShort,
    IncorrectPacketLength,
    WrongVersion,
    WrongPacketType,
    MissingKeyFlag,
    NoSuchSession,
    SessionClosed,
    AckOutOfSequence,
    AckForUnknownSequence,
    OutOfSequence,
    BrokenPppHeader,
    NotForwarding,
    IngressFiltered,
    EncryptionRequired,
    UnexpectedCompression,
    NotEncrypted,
    CoherencyOutOfRange,
    CoherencyMismatch,
    UnexpectedCcp,
    QueueFull,
}
