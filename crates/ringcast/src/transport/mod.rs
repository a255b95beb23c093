// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Datagram transports below the ring engine.
//!
//! The engine sees the network as a plain datagram channel: multicast a
//! frame to the whole ring, or unicast a token frame to one member. The
//! [`udp`] implementation runs a real ring over UDP multicast; [`mem`] is a
//! process-local switch used by the simulation tests and the bench tool.

pub mod mem;
pub mod udp;

use std::io;

use crate::member::ProcessorId;

/// Datagram channel used by the engine.
///
/// Sends are best-effort: a failed or dropped frame is recovered by the
/// protocol's retransmit machinery, so implementations report only hard
/// local errors.
pub trait Transport {
    /// Multicast `frame` to every ring member, including the local
    /// processor (the engine relies on multicast loopback).
    fn mcast(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Unicast `frame` (a token) to one member.
    fn unicast(&mut self, to: &ProcessorId, frame: &[u8]) -> io::Result<()>;
}
