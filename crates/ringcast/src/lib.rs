// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! # ringcast - totally-ordered group messaging over a rotating-token ring
//!
//! A pure Rust implementation of the Totem single-ring protocol: virtually
//! synchronous, agreed/safe-ordered multicast across a dynamically changing
//! set of processors, with automatic failure detection, ring re-formation,
//! and message recovery across membership transitions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ringcast::{Guarantee, ProcessorId, Runtime, TotemConfig};
//!
//! fn main() -> ringcast::Result<()> {
//!     let config = TotemConfig::default();
//!     let mut runtime = Runtime::bind(
//!         config,
//!         ProcessorId::new(1, "192.168.1.10".parse().unwrap()),
//!         Box::new(|source, payload, _swapped| {
//!             println!("{} says {:?}", source, payload);
//!         }),
//!         Box::new(|kind, members, _left, _joined, ring_id| {
//!             println!("{:?} config on ring {}: {} members", kind, ring_id, members.len());
//!         }),
//!     )?;
//!
//!     runtime.engine_mut().mcast(b"hello ring", Guarantee::Agreed)?;
//!     runtime.run()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       Upper service                          |
//! |        mcast / avail / deliver_fn / confchg_fn               |
//! +--------------------------------------------------------------+
//! |                        TotemEngine                           |
//! |  token engine | membership state machine | delivery pipeline |
//! |  sort queues  | timers                   | ring id store     |
//! +--------------------------------------------------------------+
//! |                         Transport                            |
//! |     UDP multicast + unicast token  |  in-memory switch       |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Guarantees
//!
//! - **Agreed order**: within one ring every live member delivers the same
//!   messages in the same sequence order.
//! - **Safe order**: a SAFE message is delivered only after every member of
//!   its origin ring is known to have received it.
//! - **Virtual synchrony**: membership changes are totally ordered against
//!   message deliveries; a transitional configuration delivers the prior
//!   ring's in-flight messages before the new ring's first message.
//!
//! The protocol stalls by design while a majority of the configured ring is
//! unreachable; it resumes when connectivity returns.

/// Protocol constants and runtime configuration.
pub mod config;
/// The protocol engine (token handling, membership, delivery).
pub mod engine;
/// Processor identity and member-set algebra.
pub mod member;
/// Persisted ring-sequence counter.
pub mod ringid;
/// mio-driven event loop binding an engine to the UDP transport.
pub mod runtime;
/// Wrap-safe sequence comparisons.
pub mod seq;
/// Sparse sequence-indexed message store.
pub mod sortq;
/// Deadline table for the protocol timers.
pub mod timers;
/// Datagram transports (UDP, in-memory switch).
pub mod transport;
/// Wire codec for the six totem frame types.
pub mod wire;

pub use config::TotemConfig;
pub use engine::{
    CallbackHandle, ConfchgFn, ConfigurationType, DeliverFn, MembState, TokenCallbackType,
    TotemEngine,
};
pub use member::ProcessorId;
pub use runtime::Runtime;
pub use transport::Transport;
pub use wire::{Guarantee, RingId};

/// ringcast version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors surfaced by the ringcast API.
///
/// Protocol events (token loss, peer failure, re-formation) are never
/// errors; they surface as configuration-change callbacks. Only API misuse
/// and local resource problems reach this type.
#[derive(Debug)]
pub enum Error {
    /// Rejected configuration (see the message for the offending knob).
    InvalidConfig(String),
    /// The pending-message queue is full; retry after deliveries drain it.
    QueueFull,
    /// Payload exceeds what one frame can carry at the configured MTU.
    PayloadTooLarge {
        /// Submitted payload length.
        len: usize,
        /// Largest allowed payload.
        max: usize,
    },
    /// The engine was started twice.
    AlreadyStarted,
    /// I/O error from the transport or event loop.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::QueueFull => write!(f, "pending message queue is full"),
            Error::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds frame maximum {}", len, max)
            }
            Error::AlreadyStarted => write!(f, "engine already started"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
