// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! ORF token processing.
//!
//! The token is the ring's single rotating authority: whoever holds it may
//! originate multicasts (taking fresh sequence numbers from `token.seq`),
//! must service the retransmit-request list, and advances the ring-wide
//! ARU. This module is the translation of that contract into engine state;
//! the membership state machine only decides *which* queues the token
//! drains.

use std::time::Instant;

use crate::config::{MISSING_MCAST_WINDOW, RETRANSMIT_ENTRIES_MAX, TRANSMITS_ALLOWED};
use crate::member::ProcessorId;
use crate::seq::{seq_lt, seq_lte, seq_min};
use crate::timers::TimerKind;
use crate::wire::{HoldCancelMsg, MessageType, OrfToken, RtrItem, TotemHeader};
use crate::config::{SEQNO_START_MSG, SEQNO_START_TOKEN};

use super::{MembState, SortItem, TokenCallbackType, TotemEngine};

impl TotemEngine {
    /// Handle a received ORF token.
    pub(crate) fn message_handler_orf_token(&mut self, mut token: OrfToken, now: Instant) {
        // An unchanged token.seq means the ring carried no new traffic this
        // rotation: candidate for merging and for token hold.
        if token.seq == self.my_last_seq {
            self.start_merge_detect_timeout(now);
            self.my_seq_unchanged += 1;
        } else {
            self.timers.cancel(TimerKind::MergeDetect);
            self.timers.cancel(TimerKind::TokenHoldRetransmit);
            self.my_seq_unchanged = 0;
        }
        self.my_last_seq = token.seq;

        // Only the representative actually withholds the token; everyone
        // else just notes the hold so hold-cancel traffic stays meaningful.
        self.my_token_held = false;
        let i_am_rep = self.my_ring_id.rep == self.my_id;
        if i_am_rep && self.my_seq_unchanged > self.config.seqno_unchanged_const {
            self.my_token_held = true;
        } else if !i_am_rep && self.my_seq_unchanged >= self.config.seqno_unchanged_const {
            self.my_token_held = true;
        }
        let forward_token = !(i_am_rep && self.my_token_held);

        self.token_callbacks_execute(TokenCallbackType::Received);

        if self.state == MembState::Commit {
            // The commit token owns ring formation now; discard.
            self.heartbeat_after_token(forward_token, now);
            return;
        }

        if self.state == MembState::Operational {
            // Free with the previous rotation's aru still in my_last_aru:
            // coverage must have been visible for a full rotation.
            self.messages_free(token.aru);
        }

        let last_aru = self.my_last_aru;
        self.my_last_aru = token.aru;
        let aru_on_arrival = token.aru;

        // Tokens from another configuration are discarded.
        if token.ring_id != self.my_ring_id {
            self.heartbeat_after_token(forward_token, now);
            return;
        }

        // A retransmitted token proves the previous member is alive; that
        // alone refreshes the loss timer.
        if seq_lte(token.token_seq, self.my_token_seq) {
            self.reset_token_timeout(now);
            self.heartbeat_after_token(forward_token, now);
            return;
        }

        let mut transmits_allowed = TRANSMITS_ALLOWED;
        let remcasts = self.orf_token_rtr(&mut token, &mut transmits_allowed);

        // Safety valve: when the ring has raced this far ahead of the
        // slowest releaser, stop originating until it catches up.
        if seq_lt(
            self.last_released.wrapping_add(MISSING_MCAST_WINDOW),
            token.seq.wrapping_add(TRANSMITS_ALLOWED),
        ) {
            log::debug!(
                "[token] {} origination paused, last released {:x} token seq {:x}",
                self.my_id,
                self.last_released,
                token.seq
            );
            transmits_allowed = 0;
        }
        let mcasts = self.orf_token_mcast(&mut token, transmits_allowed, now);
        token.fcc = u16::try_from(mcasts + remcasts).unwrap_or(u16::MAX);

        // ARU advancement: overwrite when we are behind the carried aru's
        // owner, or when we own it, or when nobody does.
        if seq_lt(self.my_aru, token.aru)
            || token.aru_addr == self.my_id
            || token.aru_addr.is_zero()
        {
            token.aru = self.my_aru;
            if token.aru == token.seq {
                token.aru_addr = ProcessorId::zero();
            } else {
                token.aru_addr = self.my_id;
            }
        }

        // Everything at or below min(arrival aru, previous rotation's aru)
        // has provably been received by every member: the watermark that
        // releases SAFE messages for delivery.
        if self.state == MembState::Operational {
            let proven = seq_min(aru_on_arrival, last_aru);
            if seq_lt(self.my_safe_point, proven) {
                self.my_safe_point = proven;
            }
        }

        // Failure detector: an aru pinned by the same owner for too many
        // rotations means that owner stopped receiving.
        if token.aru == last_aru && !token.aru_addr.is_zero() {
            self.my_aru_count += 1;
        } else {
            self.my_aru_count = 0;
        }

        if self.my_aru_count > self.config.fail_to_recv_const && token.aru_addr != self.my_id {
            log::warn!(
                "[token] {} declaring {} failed to receive after {} rotations",
                self.my_id,
                token.aru_addr,
                self.my_aru_count
            );
            let failed = token.aru_addr;
            self.my_failed_list.insert(failed);
            self.ring_state_restore();
            self.memb_state_gather_enter(now);
        } else {
            self.my_token_seq = token.token_seq;
            token.token_seq = token.token_seq.wrapping_add(1);

            if self.state == MembState::Recovery {
                self.recovery_token_rotation(&mut token, last_aru);
            }

            self.token_send(&mut token, forward_token);

            // Deliver after the token has moved on; the next member is not
            // kept waiting on local delivery work.
            if self.state == MembState::Operational {
                self.messages_deliver_to_app(false, self.my_high_seq_received, true);
            }

            self.reset_token_timeout(now);
            self.reset_token_retransmit_timeout(now);
            if i_am_rep && self.my_token_held {
                self.timers.arm(
                    TimerKind::TokenHoldRetransmit,
                    now + self.config.token_hold_timeout,
                );
            }
            self.token_callbacks_execute(TokenCallbackType::Sent);
        }

        self.heartbeat_after_token(forward_token, now);
    }

    /// Recovery-state token bookkeeping: the retransmit flag must round
    /// trip clear, then stay clear while the install point rotates, before
    /// this processor re-enters operational state.
    fn recovery_token_rotation(&mut self, token: &mut OrfToken, last_aru: u32) {
        // my_aru == my_high_seq_received and an empty retransmit queue
        // means everything this processor can recover has been recovered.
        let low_water = seq_min(self.my_aru, last_aru);
        if !self.retrans_message_queue.is_empty() || low_water != self.my_high_seq_received {
            if !token.retrans_flg {
                token.retrans_flg = true;
                self.my_set_retrans_flg = true;
            }
        } else if token.retrans_flg && self.my_set_retrans_flg {
            token.retrans_flg = false;
        }
        log::debug!(
            "[token] {} recovery: retrans flag {} mine {} queue empty {} count {} \
             low water {:x} aru {:x}",
            self.my_id,
            token.retrans_flg,
            self.my_set_retrans_flg,
            self.retrans_message_queue.is_empty(),
            self.my_retrans_flg_count,
            low_water,
            token.aru
        );

        if token.retrans_flg {
            self.my_retrans_flg_count = 0;
        } else {
            self.my_retrans_flg_count += 1;
        }
        if self.my_retrans_flg_count == 2 {
            self.my_install_seq = token.seq;
        }

        if self.my_retrans_flg_count >= 2
            && seq_lte(self.my_install_seq, self.my_aru)
            && !self.my_received_flg
        {
            self.my_received_flg = true;
            self.my_deliver_memb = self.my_trans_memb.clone();
        }
        if self.my_retrans_flg_count >= 3 && seq_lte(self.my_install_seq, token.aru) {
            self.my_rotation_counter += 1;
        } else {
            self.my_rotation_counter = 0;
        }
        if self.my_rotation_counter == 2 {
            log::debug!(
                "[token] {} recovery complete: install seq {:x} aru {:x} token seq {:x}",
                self.my_id,
                self.my_install_seq,
                self.my_aru,
                token.seq
            );
            self.memb_state_operational_enter();
            self.my_rotation_counter = 0;
            self.my_retrans_flg_count = 0;
        }
    }

    fn heartbeat_after_token(&mut self, forward_token: bool, now: Instant) {
        if forward_token && self.heartbeat_timeout.is_some() {
            self.reset_heartbeat_timeout(now);
        } else {
            self.cancel_heartbeat_timeout();
        }
    }

    // ===================================================================
    // Retransmission
    // ===================================================================

    /// Service and refill the token's retransmit-request list. Returns the
    /// number of retransmitted messages; `transmits_allowed` is reduced by
    /// the credits they consumed.
    fn orf_token_rtr(&mut self, token: &mut OrfToken, transmits_allowed: &mut u32) -> u32 {
        if !token.rtr_list.is_empty() {
            log::debug!(
                "[token] {} retransmit list: {:x?}",
                self.my_id,
                token.rtr_list.iter().map(|r| r.seq).collect::<Vec<_>>()
            );
        }

        let mut remcasts = 0u32;
        let mut index = 0;
        while remcasts <= *transmits_allowed && index < token.rtr_list.len() {
            // Requests left over from another configuration stay on the
            // list; their owner rewrites them after the ring settles.
            if token.rtr_list[index].ring_id != self.my_ring_id {
                index += 1;
                continue;
            }
            if self.orf_token_remcast(token.rtr_list[index].seq) {
                token.rtr_list.remove(index);
                remcasts += 1;
            } else {
                index += 1;
            }
        }
        *transmits_allowed = transmits_allowed.saturating_sub(remcasts + 1);

        // Add our own gaps, up to the list bound.
        let range = self.my_high_seq_received.wrapping_sub(self.my_aru);
        debug_assert!(range < 100_000, "sequence state diverged");
        let sort_queue = match self.state {
            MembState::Recovery => &self.recovery_sort_queue,
            _ => &self.regular_sort_queue,
        };
        for i in 1..=range {
            if token.rtr_list.len() >= RETRANSMIT_ENTRIES_MAX {
                break;
            }
            let seq = self.my_aru.wrapping_add(i);
            if !sort_queue.in_range(seq) {
                break;
            }
            if !sort_queue.inuse(seq) && !token.rtr_list.iter().any(|r| r.seq == seq) {
                token.rtr_list.push(RtrItem {
                    ring_id: self.my_ring_id,
                    seq,
                });
            }
        }
        remcasts
    }

    /// Remulticast one stored message. True when the message was found
    /// (and therefore consumed a flow-control credit).
    fn orf_token_remcast(&mut self, seq: u32) -> bool {
        let sort_queue = match self.state {
            MembState::Recovery => &self.recovery_sort_queue,
            _ => &self.regular_sort_queue,
        };
        let Some(item) = sort_queue.get(seq) else {
            return false;
        };
        let frame = item.frame.clone();
        if let Err(e) = self.transport.mcast(&frame) {
            log::debug!("[token] {} retransmit of {:x} failed: {}", self.my_id, seq, e);
        }
        true
    }

    // ===================================================================
    // Origination
    // ===================================================================

    /// Multicast pending messages while flow-control credits remain,
    /// assigning each the next token sequence. Returns the count sent.
    fn orf_token_mcast(&mut self, token: &mut OrfToken, transmits_allowed: u32, now: Instant) -> u32 {
        let in_recovery = self.state == MembState::Recovery;
        if in_recovery {
            self.reset_token_retransmit_timeout(now);
        }

        let mut mcasts = 0u32;
        while mcasts < transmits_allowed {
            let queue_empty = if in_recovery {
                self.retrans_message_queue.is_empty()
            } else {
                self.new_message_queue.is_empty()
            };
            if queue_empty {
                break;
            }

            // Between rings with unfinished recovery work, origination
            // would assign sequences the next ring cannot account for.
            if self.old_ring_state_saved
                && matches!(self.state, MembState::Gather | MembState::Commit)
            {
                log::debug!(
                    "[token] {} not multicasting at seq {:x} during transition",
                    self.my_id,
                    token.seq
                );
                return mcasts;
            }

            let Some(mut pending) = (if in_recovery {
                self.retrans_message_queue.pop_front()
            } else {
                self.new_message_queue.pop_front()
            }) else {
                break;
            };

            token.seq = token.seq.wrapping_add(1);
            pending.header.seq = token.seq;
            pending.header.this_seqno = self.global_seqno;
            self.global_seqno = self.global_seqno.wrapping_add(1);
            pending.header.ring_id = self.my_ring_id;

            let frame = pending.header.encode_frame(&pending.payload);
            let sort_queue = if in_recovery {
                &mut self.recovery_sort_queue
            } else {
                &mut self.regular_sort_queue
            };
            if !sort_queue.add(token.seq, SortItem { frame: frame.clone() }) {
                // Flow control keeps the window narrower than the queue;
                // out of range here means state corruption.
                log::error!(
                    "[token] {} originated seq {:x} outside sort queue window",
                    self.my_id,
                    token.seq
                );
            }
            if let Err(e) = self.transport.mcast(&frame) {
                log::debug!("[token] {} multicast of {:x} failed: {}", self.my_id, token.seq, e);
            }
            mcasts += 1;
        }

        // The token's seq is the ring's high watermark, whether or not we
        // originated anything this visit.
        self.my_high_seq_received = token.seq;
        self.update_aru();
        mcasts
    }

    /// Advance `my_aru` over the contiguous prefix of received messages.
    pub(crate) fn update_aru(&mut self) {
        let sort_queue = match self.state {
            MembState::Recovery => &self.recovery_sort_queue,
            _ => &self.regular_sort_queue,
        };
        let range = self.my_high_seq_received.wrapping_sub(self.my_aru);
        if range > 1024 {
            return;
        }
        let mut advanced = 0;
        for i in 1..=range {
            if !sort_queue.inuse(self.my_aru.wrapping_add(i)) {
                break;
            }
            advanced = i;
        }
        self.my_aru = self.my_aru.wrapping_add(advanced);
        self.my_received_flg = self.my_aru == self.my_high_seq_received;
    }

    /// Release regular-queue messages whose coverage is globally known: at
    /// or below min(token aru, previous rotation's aru, own deliveries).
    fn messages_free(&mut self, token_aru: u32) {
        let mut release_to = token_aru;
        if seq_lt(self.my_last_aru, release_to) {
            release_to = self.my_last_aru;
        }
        if seq_lt(self.my_high_delivered, release_to) {
            release_to = self.my_high_delivered;
        }
        if seq_lt(release_to, self.last_released) {
            return;
        }
        let range = release_to.wrapping_sub(self.last_released);
        if range == 0 {
            return;
        }
        debug_assert!(range < 1024, "release range diverged");

        self.regular_sort_queue.release_up_to(release_to);
        self.last_released = release_to;
        log::debug!(
            "[token] {} released messages up to {:x}",
            self.my_id,
            release_to
        );
    }

    // ===================================================================
    // Token transmission
    // ===================================================================

    /// Stamp, store for retransmission, and (unless holding) forward the
    /// token to the next member.
    pub(crate) fn token_send(&mut self, token: &mut OrfToken, forward_token: bool) {
        token.header.nodeid = self.my_id.nodeid;
        let frame = token.encode();
        self.orf_token_retransmit = frame.clone();

        if !forward_token {
            return;
        }
        let next = self.next_memb;
        if let Err(e) = self.transport.unicast(&next, &frame) {
            log::debug!("[token] {} token send to {} failed: {}", self.my_id, next, e);
        }
    }

    /// Resend the stored token to the next member.
    pub(crate) fn token_retransmit(&mut self) {
        if self.orf_token_retransmit.is_empty() {
            return;
        }
        let frame = self.orf_token_retransmit.clone();
        let next = self.next_memb;
        if let Err(e) = self.transport.unicast(&next, &frame) {
            log::debug!(
                "[token] {} token retransmit to {} failed: {}",
                self.my_id,
                next,
                e
            );
        }
    }

    /// The representative's first token on a freshly committed ring.
    pub(crate) fn orf_token_send_initial(&mut self) {
        let mut token = OrfToken {
            header: TotemHeader {
                msg_type: MessageType::OrfToken,
                encapsulated: false,
                nodeid: self.my_id.nodeid,
            },
            seq: SEQNO_START_MSG,
            token_seq: SEQNO_START_TOKEN,
            aru: SEQNO_START_MSG.wrapping_sub(1),
            aru_addr: self.my_id,
            ring_id: self.my_ring_id,
            fcc: 0,
            retrans_flg: true,
            rtr_list: Vec::new(),
        };
        self.my_set_retrans_flg = true;
        self.token_send(&mut token, true);
    }

    // ===================================================================
    // Token hold cancellation
    // ===================================================================

    /// Multicast a hold cancel if the token is currently held; new work
    /// arrived and the ring must resume rotating at full speed.
    pub(crate) fn token_hold_cancel_send(&mut self) {
        if !self.my_token_held {
            return;
        }
        self.my_token_held = false;

        let cancel = HoldCancelMsg {
            header: TotemHeader {
                msg_type: MessageType::HoldCancel,
                encapsulated: false,
                nodeid: self.my_id.nodeid,
            },
            ring_id: self.my_ring_id,
        };
        if let Err(e) = self.transport.mcast(&cancel.encode()) {
            log::debug!("[token] {} hold cancel send failed: {}", self.my_id, e);
        }
    }

    /// Handle a hold cancel: the ring has pending work again.
    pub(crate) fn message_handler_hold_cancel(&mut self, cancel: &HoldCancelMsg, now: Instant) {
        if cancel.ring_id != self.my_ring_id {
            return;
        }
        self.my_seq_unchanged = 0;
        if self.my_ring_id.rep == self.my_id
            && matches!(self.state, MembState::Operational | MembState::Recovery)
        {
            self.token_retransmit();
            self.reset_token_retransmit_timeout(now);
        }
    }

    /// Token-loss path shared by the loss timer and the heartbeat timer.
    pub(crate) fn token_loss(&mut self, now: Instant) {
        match self.state {
            MembState::Operational | MembState::Commit => {
                self.memb_state_gather_enter(now);
            }
            MembState::Gather => {
                self.memb_state_consensus_timeout_expired(now);
                self.memb_state_gather_enter(now);
            }
            MembState::Recovery => {
                self.ring_state_restore();
                self.memb_state_gather_enter(now);
            }
        }
    }
}
