// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Protocol constants and runtime configuration - single source of truth.
//!
//! Every tunable and every protocol limit lives here. **Never hardcode
//! elsewhere!** The constants section covers the fixed protocol limits (flow
//! control window, queue depths, retransmit list bound); [`TotemConfig`]
//! carries the per-deployment timing knobs injected by the caller.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

// =======================================================================
// Protocol limits (fixed by the protocol, not tunable)
// =======================================================================

/// Maximum processors in a single ring.
pub const PROCESSOR_COUNT_MAX: usize = 384;

/// Flow-control budget per token visit: at most this many multicasts
/// (originations plus retransmissions) each time the token is held.
pub const TRANSMITS_ALLOWED: u32 = 16;

/// Capacity of each sort queue (regular and recovery), in messages.
pub const QUEUE_RTR_ITEMS_SIZE_MAX: usize = 256;

/// Capacity of the recovery re-origination queue, in messages.
pub const RETRANS_MESSAGE_QUEUE_SIZE_MAX: usize = 500;

/// Maximum retransmit-request entries carried on one token.
pub const RETRANSMIT_ENTRIES_MAX: usize = 30;

/// Origination stops when the ring is this many sequence numbers ahead of
/// the slowest releaser; keeps a lagging receiver from being buried.
pub const MISSING_MCAST_WINDOW: u32 = 128;

/// Largest message the upper layer may submit across all fragments; sizes
/// the new-message queue relative to the MTU.
pub const MESSAGE_SIZE_MAX: usize = 256 * 1024;

/// First message sequence number of a freshly installed ring.
pub const SEQNO_START_MSG: u32 = 0;

/// First token sequence number of a freshly installed ring.
pub const SEQNO_START_TOKEN: u32 = 0;

/// Ring sequence advance per installation. Leaves room between installs for
/// partitioned halves to install independently and still merge monotonic.
pub const RING_SEQ_INCREMENT: u64 = 4;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Timing and transport knobs for one ring engine.
///
/// The defaults suit a quiet LAN. The one derived value is the heartbeat
/// timeout, see [`TotemConfig::heartbeat_timeout`]; heartbeat is disabled
/// when the derivation is not strictly below `token_timeout`.
#[derive(Clone, Debug)]
pub struct TotemConfig {
    /// Time without token or multicast traffic before the token is declared
    /// lost and the membership re-forms.
    pub token_timeout: Duration,
    /// Interval after which the last-sent token is retransmitted to the next
    /// member if nothing came back around.
    pub token_retransmit_timeout: Duration,
    /// How long the representative sits on the token when the ring is idle.
    pub token_hold_timeout: Duration,
    /// Re-broadcast interval for JOIN messages while gathering.
    pub join_timeout: Duration,
    /// Time allowed for the gather phase to reach consensus before the
    /// non-responding processors are declared failed.
    pub consensus_timeout: Duration,
    /// Delay before the representative advertises its ring for merging.
    pub merge_timeout: Duration,
    /// Interface re-check interval used by the runtime after a NIC drop.
    pub downcheck_timeout: Duration,
    /// Token rotations with a stalled ARU before the stuck processor is
    /// declared failed.
    pub fail_to_recv_const: u32,
    /// Idle token rotations before the representative holds the token.
    pub seqno_unchanged_const: u32,
    /// Network MTU; one multicast frame never exceeds this.
    pub net_mtu: usize,
    /// Missed heartbeats tolerated before the fast failure path fires.
    /// Zero disables the heartbeat mechanism entirely.
    pub heartbeat_failures_allowed: u32,
    /// Worst-case one-way network delay, padding the heartbeat derivation.
    pub max_network_delay: Duration,
    /// Multicast group the ring communicates on.
    pub mcast_group: Ipv4Addr,
    /// UDP port for both multicast traffic and unicast token passing.
    pub port: u16,
    /// Directory holding the persisted ring-sequence counter.
    pub ring_id_dir: PathBuf,
}

impl Default for TotemConfig {
    fn default() -> Self {
        Self {
            token_timeout: Duration::from_millis(1000),
            token_retransmit_timeout: Duration::from_millis(238),
            token_hold_timeout: Duration::from_millis(180),
            join_timeout: Duration::from_millis(100),
            consensus_timeout: Duration::from_millis(200),
            merge_timeout: Duration::from_millis(200),
            downcheck_timeout: Duration::from_millis(1000),
            fail_to_recv_const: 50,
            seqno_unchanged_const: 30,
            net_mtu: 1500,
            heartbeat_failures_allowed: 0,
            max_network_delay: Duration::from_millis(50),
            mcast_group: Ipv4Addr::new(239, 192, 104, 1),
            port: 5405,
            ring_id_dir: PathBuf::from("/var/run/ringcast"),
        }
    }
}

impl TotemConfig {
    /// Validate the combination of knobs.
    pub fn validate(&self) -> Result<()> {
        if self.token_timeout.is_zero() {
            return Err(Error::InvalidConfig("token_timeout must be non-zero".into()));
        }
        if self.token_retransmit_timeout >= self.token_timeout {
            return Err(Error::InvalidConfig(
                "token_retransmit_timeout must be below token_timeout".into(),
            ));
        }
        if self.join_timeout.is_zero() || self.consensus_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "join_timeout and consensus_timeout must be non-zero".into(),
            ));
        }
        if self.net_mtu < crate::wire::MCAST_HEADER_LEN + 64 {
            return Err(Error::InvalidConfig(format!(
                "net_mtu {} too small for a multicast frame",
                self.net_mtu
            )));
        }
        if !self.mcast_group.is_multicast() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a multicast group",
                self.mcast_group
            )));
        }
        Ok(())
    }

    /// Derived heartbeat timeout, or `None` when heartbeat is disabled.
    ///
    /// `heartbeat_failures_allowed * token_retransmit_timeout +
    /// max_network_delay`, required to be strictly below `token_timeout`;
    /// otherwise the fast path would be no faster than token loss and is
    /// disabled with a warning.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        if self.heartbeat_failures_allowed == 0 {
            return None;
        }
        let timeout =
            self.token_retransmit_timeout * self.heartbeat_failures_allowed + self.max_network_delay;
        if timeout >= self.token_timeout {
            log::warn!(
                "[config] heartbeat timeout {}ms is not below token timeout {}ms, \
                 heartbeat disabled",
                timeout.as_millis(),
                self.token_timeout.as_millis()
            );
            return None;
        }
        Some(timeout)
    }

    /// Largest payload the upper layer may hand to `mcast` in one call.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.net_mtu - crate::wire::MCAST_HEADER_LEN
    }

    /// Depth of the new-message queue: enough pending frames to cover one
    /// maximum-size upper-layer message fragmented at the effective MTU.
    #[must_use]
    pub fn new_message_queue_depth(&self) -> usize {
        (MESSAGE_SIZE_MAX / self.max_payload()).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        TotemConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_retransmit_must_undercut_token_timeout() {
        let config = TotemConfig {
            token_retransmit_timeout: Duration::from_millis(2000),
            ..TotemConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_mtu_rejected() {
        let config = TotemConfig {
            net_mtu: 80,
            ..TotemConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_disabled_by_default() {
        assert_eq!(TotemConfig::default().heartbeat_timeout(), None);
    }

    #[test]
    fn test_heartbeat_derivation() {
        let config = TotemConfig {
            heartbeat_failures_allowed: 2,
            ..TotemConfig::default()
        };
        // 2 * 238ms + 50ms = 526ms < 1000ms token timeout.
        assert_eq!(
            config.heartbeat_timeout(),
            Some(Duration::from_millis(526))
        );
    }

    #[test]
    fn test_heartbeat_disabled_when_exceeding_token_timeout() {
        let config = TotemConfig {
            heartbeat_failures_allowed: 10,
            ..TotemConfig::default()
        };
        // 10 * 238ms + 50ms = 2430ms >= 1000ms: disabled.
        assert_eq!(config.heartbeat_timeout(), None);
    }

    #[test]
    fn test_queue_depth_scales_with_mtu() {
        let config = TotemConfig::default();
        assert!(config.new_message_queue_depth() > 100);
        let jumbo = TotemConfig {
            net_mtu: 9000,
            ..TotemConfig::default()
        };
        assert!(jumbo.new_message_queue_depth() < config.new_message_queue_depth());
    }
}
