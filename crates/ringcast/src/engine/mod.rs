// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! The ring engine: one totem protocol instance.
//!
//! [`TotemEngine`] owns every piece of protocol state - the sort queues,
//! the member sets, the timers, the transport - and is driven from the
//! outside by three calls: [`TotemEngine::handle_frame`] for every incoming
//! datagram, [`TotemEngine::poll_timers`] when a deadline passes, and the
//! upper-layer API (`mcast`, `avail`, `new_msg_signal`, token callbacks).
//! Everything runs on the caller's thread; there is no interior
//! concurrency, which is what makes the ordering guarantees cheap to keep.
//!
//! The implementation is split by concern:
//!
//! - `token`: ORF token processing - flow control, origination,
//!   retransmission, ARU advancement, hold mode.
//! - `membership`: the operational / gather / commit / recovery state
//!   machine and its frame handlers.
//! - `delivery`: in-order delivery to the upper layer and the recovery
//!   drain that carries prior-ring messages across an installation.

mod delivery;
mod membership;
mod token;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{
    TotemConfig, QUEUE_RTR_ITEMS_SIZE_MAX, SEQNO_START_MSG, SEQNO_START_TOKEN,
};
use crate::member::{MemberList, ProcessorId};
use crate::ringid::RingIdStore;
use crate::sortq::SortQueue;
use crate::timers::{TimerKind, Timers};
use crate::transport::Transport;
use crate::wire::{self, Guarantee, McastHeader, Message, RingId};
use crate::{Error, Result};

/// Which configuration event a confchg callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationType {
    /// The intersection of old and new memberships; delivered before any
    /// prior-ring message recovered across the transition.
    Transitional,
    /// The newly installed membership.
    Regular,
}

/// Membership state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembState {
    Operational,
    Gather,
    Commit,
    Recovery,
}

/// Token callback trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCallbackType {
    /// Fired on every token reception.
    Received,
    /// Fired after every successful token send.
    Sent,
}

/// Handle returned by [`TotemEngine::callback_token_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(u64);

/// Per-message delivery callback: source, payload, and whether the frame
/// came from a peer of the opposite byte order.
pub type DeliverFn = Box<dyn FnMut(&ProcessorId, &[u8], bool)>;

/// Configuration-change callback: type, members, left, joined, ring id.
pub type ConfchgFn =
    Box<dyn FnMut(ConfigurationType, &[ProcessorId], &[ProcessorId], &[ProcessorId], &RingId)>;

/// A locally originated message waiting for token possession.
pub(crate) struct PendingMessage {
    pub(crate) header: McastHeader,
    pub(crate) payload: Vec<u8>,
}

/// One stored multicast frame (raw bytes, as multicast or re-originated).
#[derive(Clone)]
pub(crate) struct SortItem {
    pub(crate) frame: Vec<u8>,
}

struct TokenCallback {
    handle: u64,
    cb_type: TokenCallbackType,
    oneshot: bool,
    f: Box<dyn FnMut(TokenCallbackType) -> bool>,
}

/// One totem single-ring protocol instance.
pub struct TotemEngine {
    pub(crate) config: TotemConfig,
    pub(crate) my_id: ProcessorId,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) deliver_fn: DeliverFn,
    pub(crate) confchg_fn: ConfchgFn,

    pub(crate) state: MembState,
    started: bool,

    // Member sets of the membership algorithm.
    pub(crate) my_proc_list: MemberList,
    pub(crate) my_failed_list: MemberList,
    pub(crate) my_new_memb: MemberList,
    pub(crate) my_trans_memb: MemberList,
    pub(crate) my_memb: MemberList,
    pub(crate) my_deliver_memb: MemberList,
    pub(crate) consensus_set: Vec<ProcessorId>,

    // Ring identity.
    pub(crate) my_ring_id: RingId,
    pub(crate) my_old_ring_id: RingId,
    pub(crate) token_ring_id_seq: u64,
    pub(crate) ring_id_store: RingIdStore,

    // Sequence state.
    pub(crate) my_aru: u32,
    pub(crate) my_high_delivered: u32,
    pub(crate) my_high_seq_received: u32,
    pub(crate) my_last_aru: u32,
    pub(crate) my_aru_count: u32,
    pub(crate) my_seq_unchanged: u32,
    pub(crate) my_last_seq: u32,
    pub(crate) my_token_seq: u32,
    pub(crate) my_install_seq: u32,
    pub(crate) my_rotation_counter: u32,
    pub(crate) my_set_retrans_flg: bool,
    pub(crate) my_retrans_flg_count: u32,
    pub(crate) my_received_flg: bool,
    pub(crate) my_high_ring_delivered: u32,
    pub(crate) my_safe_point: u32,
    pub(crate) last_released: u32,
    pub(crate) global_seqno: i32,
    pub(crate) my_token_held: bool,

    // Prior-ring state saved across a membership transition.
    pub(crate) old_ring_state_saved: bool,
    pub(crate) old_ring_state_aru: u32,
    pub(crate) old_ring_state_high_seq_received: u32,
    pub(crate) ring_saved: bool,

    // Queues.
    pub(crate) new_message_queue: VecDeque<PendingMessage>,
    pub(crate) retrans_message_queue: VecDeque<PendingMessage>,
    pub(crate) regular_sort_queue: SortQueue<SortItem>,
    pub(crate) recovery_sort_queue: SortQueue<SortItem>,
    pub(crate) new_queue_depth: usize,

    // Token forwarding.
    pub(crate) next_memb: ProcessorId,
    pub(crate) orf_token_retransmit: Vec<u8>,

    pub(crate) timers: Timers,
    pub(crate) heartbeat_timeout: Option<Duration>,

    token_callbacks: Vec<TokenCallback>,
    next_callback_handle: u64,
}

impl TotemEngine {
    /// Build an engine. Call [`TotemEngine::start`] to load the persisted
    /// ring sequence and begin forming a ring.
    pub fn new(
        config: TotemConfig,
        my_id: ProcessorId,
        transport: Box<dyn Transport>,
        deliver_fn: DeliverFn,
        confchg_fn: ConfchgFn,
    ) -> Result<Self> {
        config.validate()?;
        if my_id.nodeid == 0 {
            return Err(Error::InvalidConfig("nodeid must be non-zero".into()));
        }

        let heartbeat_timeout = config.heartbeat_timeout();
        let new_queue_depth = config.new_message_queue_depth();
        let ring_id_store = RingIdStore::new(&config.ring_id_dir, &my_id);

        log::info!(
            "[engine] {} token timeout {}ms retransmit {}ms hold {}ms join {}ms \
             consensus {}ms merge {}ms downcheck {}ms fail to recv {} \
             seqno unchanged {} mtu {} heartbeat {}",
            my_id,
            config.token_timeout.as_millis(),
            config.token_retransmit_timeout.as_millis(),
            config.token_hold_timeout.as_millis(),
            config.join_timeout.as_millis(),
            config.consensus_timeout.as_millis(),
            config.merge_timeout.as_millis(),
            config.downcheck_timeout.as_millis(),
            config.fail_to_recv_const,
            config.seqno_unchanged_const,
            config.net_mtu,
            heartbeat_timeout.map_or_else(
                || "disabled".to_string(),
                |t| format!("{}ms", t.as_millis())
            ),
        );

        Ok(Self {
            config,
            my_id,
            transport,
            deliver_fn,
            confchg_fn,
            state: MembState::Operational,
            started: false,
            my_proc_list: MemberList::new(),
            my_failed_list: MemberList::new(),
            my_new_memb: MemberList::new(),
            my_trans_memb: MemberList::new(),
            my_memb: MemberList::new(),
            my_deliver_memb: MemberList::new(),
            consensus_set: Vec::new(),
            my_ring_id: RingId::zero(),
            my_old_ring_id: RingId::zero(),
            token_ring_id_seq: 0,
            ring_id_store,
            my_aru: SEQNO_START_MSG,
            my_high_delivered: SEQNO_START_MSG,
            my_high_seq_received: SEQNO_START_MSG,
            my_last_aru: SEQNO_START_MSG,
            my_aru_count: 0,
            my_seq_unchanged: 0,
            my_last_seq: 0,
            my_token_seq: SEQNO_START_TOKEN.wrapping_sub(1),
            my_install_seq: SEQNO_START_MSG,
            my_rotation_counter: 0,
            my_set_retrans_flg: false,
            my_retrans_flg_count: 0,
            my_received_flg: true,
            my_high_ring_delivered: 0,
            my_safe_point: SEQNO_START_MSG,
            last_released: SEQNO_START_MSG,
            global_seqno: 0,
            my_token_held: false,
            old_ring_state_saved: false,
            old_ring_state_aru: 0,
            old_ring_state_high_seq_received: 0,
            ring_saved: false,
            new_message_queue: VecDeque::new(),
            retrans_message_queue: VecDeque::new(),
            regular_sort_queue: SortQueue::new(QUEUE_RTR_ITEMS_SIZE_MAX, SEQNO_START_MSG),
            recovery_sort_queue: SortQueue::new(QUEUE_RTR_ITEMS_SIZE_MAX, SEQNO_START_MSG),
            new_queue_depth,
            next_memb: ProcessorId::zero(),
            orf_token_retransmit: Vec::new(),
            timers: Timers::new(),
            heartbeat_timeout,
            token_callbacks: Vec::new(),
            next_callback_handle: 1,
        })
    }

    /// Load the persisted ring sequence and start forming a ring.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;

        self.my_ring_id = RingId {
            rep: self.my_id,
            seq: self.ring_id_store.load(),
        };
        self.token_ring_id_seq = self.my_ring_id.seq;
        log::info!(
            "[engine] {} loaded ring sequence {}",
            self.my_id,
            self.my_ring_id.seq
        );

        self.memb_state_gather_enter(now);
        Ok(())
    }

    // ===================================================================
    // Upper-layer API
    // ===================================================================

    /// Queue a message for ordered multicast. Fails with
    /// [`Error::QueueFull`] when the pending queue is at capacity; the
    /// caller retries after deliveries drain it.
    pub fn mcast(&mut self, payload: &[u8], guarantee: Guarantee) -> Result<()> {
        if payload.len() > self.config.max_payload() {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload(),
            });
        }
        if self.new_message_queue.len() >= self.new_queue_depth {
            return Err(Error::QueueFull);
        }

        self.new_message_queue.push_back(PendingMessage {
            header: McastHeader::new(self.my_id, guarantee),
            payload: payload.to_vec(),
        });
        log::debug!(
            "[engine] {} queued {} byte {:?} message",
            self.my_id,
            payload.len(),
            guarantee
        );
        Ok(())
    }

    /// Free slots in the pending-message queue.
    #[must_use]
    pub fn avail(&self) -> usize {
        self.new_queue_depth.saturating_sub(self.new_message_queue.len())
    }

    /// Wake a ring idling in token-hold mode: cancels the hold so the
    /// token resumes circulating and picks up the queued work.
    pub fn new_msg_signal(&mut self) {
        self.token_hold_cancel_send();
    }

    /// Register a token callback. One-shot callbacks fire once and are
    /// dropped, unless they report failure - then they retry on the next
    /// token.
    pub fn callback_token_create(
        &mut self,
        cb_type: TokenCallbackType,
        oneshot: bool,
        f: Box<dyn FnMut(TokenCallbackType) -> bool>,
    ) -> CallbackHandle {
        let handle = self.next_callback_handle;
        self.next_callback_handle += 1;
        self.token_callbacks.push(TokenCallback {
            handle,
            cb_type,
            oneshot,
            f,
        });
        CallbackHandle(handle)
    }

    /// Remove a token callback. Unknown handles are ignored.
    pub fn callback_token_destroy(&mut self, handle: CallbackHandle) {
        self.token_callbacks.retain(|cb| cb.handle != handle.0);
    }

    // ===================================================================
    // Introspection
    // ===================================================================

    #[must_use]
    pub fn state(&self) -> MembState {
        self.state
    }

    #[must_use]
    pub fn ring_id(&self) -> &RingId {
        &self.my_ring_id
    }

    /// Currently installed membership.
    #[must_use]
    pub fn members(&self) -> &[ProcessorId] {
        self.my_memb.as_slice()
    }

    #[must_use]
    pub fn my_id(&self) -> &ProcessorId {
        &self.my_id
    }

    /// All-received-up-to point of the current ring.
    #[must_use]
    pub fn aru(&self) -> u32 {
        self.my_aru
    }

    /// Highest sequence delivered to the upper layer.
    #[must_use]
    pub fn high_delivered(&self) -> u32 {
        self.my_high_delivered
    }

    // ===================================================================
    // Event input
    // ===================================================================

    /// Process one incoming datagram. `src_addr` is the socket-level
    /// source; the originator nodeid comes from the frame header.
    pub fn handle_frame(&mut self, src_addr: std::net::IpAddr, frame: &[u8], now: Instant) {
        if !self.started {
            return;
        }
        let message = match wire::decode_message(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[engine] {} dropping bad frame from {}: {}", self.my_id, src_addr, e);
                return;
            }
        };

        let header = match &message {
            Message::OrfToken(m) => m.header,
            Message::Mcast(m) => m.header,
            Message::MergeDetect(m) => m.header,
            Message::Join(m) => m.header,
            Message::CommitToken(m) => m.header,
            Message::HoldCancel(m) => m.header,
        };
        if header.nodeid == 0 {
            log::warn!(
                "[engine] {} dropping frame with zero nodeid from {}",
                self.my_id,
                src_addr
            );
            return;
        }
        let system_from = ProcessorId::new(header.nodeid, src_addr);

        match message {
            Message::OrfToken(token) => self.message_handler_orf_token(token, now),
            Message::Mcast(mcast) => self.message_handler_mcast(&system_from, &mcast, frame, now),
            Message::MergeDetect(merge) => {
                self.message_handler_merge_detect(&system_from, &merge, now);
            }
            Message::Join(join) => self.message_handler_memb_join(&system_from, &join, now),
            Message::CommitToken(commit) => {
                self.message_handler_commit_token(&system_from, commit, now);
            }
            Message::HoldCancel(cancel) => self.message_handler_hold_cancel(&cancel, now),
        }
    }

    /// Fire every timer whose deadline has passed.
    pub fn poll_timers(&mut self, now: Instant) {
        for kind in self.timers.take_expired(now) {
            match kind {
                TimerKind::TokenLoss => {
                    log::info!(
                        "[engine] {} token lost in state {:?}",
                        self.my_id,
                        self.state
                    );
                    self.token_loss(now);
                }
                TimerKind::TokenRetransmit => {
                    if matches!(self.state, MembState::Operational | MembState::Recovery) {
                        self.token_retransmit();
                        self.reset_token_retransmit_timeout(now);
                    }
                }
                TimerKind::TokenHoldRetransmit => {
                    if matches!(self.state, MembState::Operational | MembState::Recovery) {
                        self.token_retransmit();
                    }
                }
                TimerKind::MergeDetect => {
                    if self.state == MembState::Operational
                        && self.my_ring_id.rep == self.my_id
                    {
                        self.memb_merge_detect_transmit();
                    }
                }
                TimerKind::Join => {
                    if matches!(self.state, MembState::Gather | MembState::Commit) {
                        self.memb_join_message_send();
                        self.timers.arm(TimerKind::Join, now + self.config.join_timeout);
                    }
                }
                TimerKind::Consensus => {
                    self.memb_state_consensus_timeout_expired(now);
                }
                TimerKind::Heartbeat => {
                    log::info!(
                        "[engine] {} heartbeat timeout, invoking token loss in state {:?}",
                        self.my_id,
                        self.state
                    );
                    self.token_loss(now);
                }
            }
        }
    }

    /// Earliest armed deadline; the event loop sleeps until then.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ===================================================================
    // Timer helpers
    // ===================================================================

    pub(crate) fn reset_token_timeout(&mut self, now: Instant) {
        self.timers
            .arm(TimerKind::TokenLoss, now + self.config.token_timeout);
    }

    pub(crate) fn reset_token_retransmit_timeout(&mut self, now: Instant) {
        self.timers.arm(
            TimerKind::TokenRetransmit,
            now + self.config.token_retransmit_timeout,
        );
    }

    pub(crate) fn reset_heartbeat_timeout(&mut self, now: Instant) {
        if let Some(timeout) = self.heartbeat_timeout {
            self.timers.arm(TimerKind::Heartbeat, now + timeout);
        }
    }

    pub(crate) fn cancel_heartbeat_timeout(&mut self) {
        self.timers.cancel(TimerKind::Heartbeat);
    }

    pub(crate) fn start_merge_detect_timeout(&mut self, now: Instant) {
        if !self.timers.is_armed(TimerKind::MergeDetect) {
            self.timers
                .arm(TimerKind::MergeDetect, now + self.config.merge_timeout);
        }
    }

    // ===================================================================
    // Saved ring state
    // ===================================================================

    /// Remember the operational ring's delivery positions before a
    /// transition, so a failed recovery can fall back to them.
    pub(crate) fn old_ring_state_save(&mut self) {
        if !self.old_ring_state_saved {
            self.old_ring_state_saved = true;
            self.old_ring_state_aru = self.my_aru;
            self.old_ring_state_high_seq_received = self.my_high_seq_received;
            log::debug!(
                "[engine] {} saving state aru {:x} high seq received {:x}",
                self.my_id,
                self.my_aru,
                self.my_high_seq_received
            );
        }
    }

    pub(crate) fn ring_save(&mut self) {
        if !self.ring_saved {
            self.ring_saved = true;
            self.my_old_ring_id = self.my_ring_id;
        }
    }

    pub(crate) fn ring_state_restore(&mut self) {
        if self.old_ring_state_saved {
            self.my_ring_id.rep = ProcessorId::zero();
            self.my_aru = self.old_ring_state_aru;
            self.my_high_seq_received = self.old_ring_state_high_seq_received;
            log::debug!(
                "[engine] {} restoring aru {:x} high seq received {:x}",
                self.my_id,
                self.my_aru,
                self.my_high_seq_received
            );
        }
    }

    // ===================================================================
    // Token callbacks
    // ===================================================================

    pub(crate) fn token_callbacks_execute(&mut self, cb_type: TokenCallbackType) {
        // One-shot callbacks are pulled out before running so a callback
        // may re-register without invalidating the iteration; a failed
        // one-shot goes back for the next token.
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.token_callbacks.len() {
            if self.token_callbacks[index].cb_type == cb_type
                && self.token_callbacks[index].oneshot
            {
                due.push(self.token_callbacks.remove(index));
            } else {
                index += 1;
            }
        }
        for mut cb in due {
            if !(cb.f)(cb_type) {
                self.token_callbacks.push(cb);
            }
        }

        let mut periodic: Vec<usize> = (0..self.token_callbacks.len())
            .filter(|&i| {
                self.token_callbacks[i].cb_type == cb_type && !self.token_callbacks[i].oneshot
            })
            .collect();
        for i in periodic.drain(..) {
            let cb = &mut self.token_callbacks[i];
            let _ = (cb.f)(cb_type);
        }
    }
}
