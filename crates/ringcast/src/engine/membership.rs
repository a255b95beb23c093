// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! The four-state membership algorithm.
//!
//! operational -> gather -> commit -> recovery -> operational. Token loss
//! or a foreign frame pushes the ring into gather, where JOIN broadcasts
//! converge everyone's proc/failed sets. Once all live candidates agree,
//! the lowest-address processor creates a commit token that rotates the new
//! membership twice - once collecting every member's prior-ring state, once
//! distributing the completed picture - and the ring enters recovery, where
//! unfinished prior-ring messages are re-originated before normal operation
//! resumes.

use std::time::Instant;

use crate::config::{
    RETRANS_MESSAGE_QUEUE_SIZE_MAX, RING_SEQ_INCREMENT, SEQNO_START_MSG, SEQNO_START_TOKEN,
};
use crate::member::{MemberList, ProcessorId};
use crate::seq::seq_lt;
use crate::timers::TimerKind;
use crate::wire::{
    CommitToken, CommitTokenMembEntry, JoinMsg, McastHeader, MergeDetectMsg, MessageType, RingId,
    TotemHeader,
};

use super::{MembState, PendingMessage, TotemEngine};

impl TotemEngine {
    // ===================================================================
    // Consensus bookkeeping
    // ===================================================================

    pub(crate) fn memb_consensus_set(&mut self, member: &ProcessorId) {
        if !self.consensus_set.contains(member) {
            self.consensus_set.push(*member);
        }
    }

    fn memb_consensus_isset(&self, member: &ProcessorId) -> bool {
        self.consensus_set.contains(member)
    }

    /// Consensus is agreed when every live candidate (proc minus failed)
    /// has echoed our exact view.
    pub(crate) fn memb_consensus_agreed(&self) -> bool {
        let live = self.my_proc_list.subtract(&self.my_failed_list);
        debug_assert!(!live.is_empty(), "gather set lost every member");
        live.iter().all(|m| self.memb_consensus_isset(m))
    }

    /// Whether this processor has the lowest address among live candidates
    /// and therefore originates the commit token.
    fn memb_lowest_in_config(&self) -> bool {
        let live = self.my_proc_list.subtract(&self.my_failed_list);
        live.lowest() == Some(self.my_id)
    }

    pub(crate) fn memb_state_consensus_timeout_expired(&mut self, now: Instant) {
        if self.memb_consensus_agreed() {
            let me = self.my_id;
            self.consensus_set.clear();
            self.memb_consensus_set(&me);
            self.reset_token_timeout(now);
        } else {
            // Whoever never echoed our view is treated as failed and the
            // gather restarts without them.
            let silent: Vec<ProcessorId> = self
                .my_proc_list
                .iter()
                .filter(|m| !self.memb_consensus_isset(m))
                .copied()
                .collect();
            self.my_failed_list.merge(&silent);
            self.memb_state_gather_enter(now);
        }
    }

    // ===================================================================
    // Outbound membership frames
    // ===================================================================

    pub(crate) fn memb_join_message_send(&mut self) {
        let join = JoinMsg {
            header: TotemHeader {
                msg_type: MessageType::Join,
                encapsulated: false,
                nodeid: self.my_id.nodeid,
            },
            ring_seq: self.my_ring_id.seq,
            proc_list: self.my_proc_list.as_slice().to_vec(),
            failed_list: self.my_failed_list.as_slice().to_vec(),
        };
        if let Err(e) = self.transport.mcast(&join.encode()) {
            log::debug!("[memb] {} join send failed: {}", self.my_id, e);
        }
    }

    pub(crate) fn memb_merge_detect_transmit(&mut self) {
        let merge = MergeDetectMsg {
            header: TotemHeader {
                msg_type: MessageType::MergeDetect,
                encapsulated: false,
                nodeid: self.my_id.nodeid,
            },
            ring_id: self.my_ring_id,
        };
        if let Err(e) = self.transport.mcast(&merge.encode()) {
            log::debug!("[memb] {} merge detect send failed: {}", self.my_id, e);
        }
    }

    // ===================================================================
    // Commit token construction and rotation
    // ===================================================================

    fn memb_state_commit_token_create(&self) -> CommitToken {
        log::info!(
            "[memb] {} creating commit token because I am the rep",
            self.my_id
        );
        let token_memb = self.my_proc_list.subtract(&self.my_failed_list).sorted();

        CommitToken {
            header: TotemHeader {
                msg_type: MessageType::CommitToken,
                encapsulated: false,
                nodeid: self.my_id.nodeid,
            },
            token_seq: 0,
            ring_id: RingId {
                rep: self.my_id,
                seq: self.token_ring_id_seq + RING_SEQ_INCREMENT,
            },
            retrans_flg: false,
            // Starts one short of a full rotation so the creator stamps
            // slot 0 on its own commit entry.
            memb_index: token_memb.len() as i32 - 1,
            memb_list: vec![CommitTokenMembEntry::unset(); token_memb.len()],
            addr: token_memb,
        }
    }

    /// Stamp this member's slot with its prior-ring state.
    fn memb_state_commit_token_update(&mut self, token: &mut CommitToken) {
        let n = token.addr.len() as i32;
        let index_this = (token.memb_index + 1).rem_euclid(n) as usize;
        debug_assert!(
            !self.my_old_ring_id.rep.is_zero(),
            "commit without a saved prior ring"
        );
        token.memb_list[index_this] = CommitTokenMembEntry {
            ring_id: self.my_old_ring_id,
            aru: self.old_ring_state_aru,
            high_delivered: self.my_high_delivered,
            received_flg: self.my_received_flg,
        };
        token.header.nodeid = self.my_id.nodeid;
    }

    /// Advance the rotation index and unicast to the next member.
    fn memb_state_commit_token_send(&mut self, token: &mut CommitToken) {
        token.token_seq = token.token_seq.wrapping_add(1);
        let n = token.addr.len() as i32;
        let index_this = (token.memb_index + 1).rem_euclid(n) as usize;
        let index_next = (index_this + 1) % token.addr.len();
        token.memb_index = index_this as i32;

        self.next_memb = token.addr[index_next];
        debug_assert!(self.next_memb.nodeid != 0);
        let next = self.next_memb;
        if let Err(e) = self.transport.unicast(&next, &token.encode()) {
            log::debug!(
                "[memb] {} commit token send to {} failed: {}",
                self.my_id,
                next,
                e
            );
        }
    }

    /// Persist and install the new ring identifier.
    fn memb_ring_id_store(&mut self, ring_id: RingId) {
        log::info!(
            "[memb] {} storing new ring sequence {}",
            self.my_id,
            ring_id.seq
        );
        self.ring_id_store.store(ring_id.seq);
        self.my_ring_id = ring_id;
        self.token_ring_id_seq = ring_id.seq;
    }

    // ===================================================================
    // State entries
    // ===================================================================

    pub(crate) fn memb_state_gather_enter(&mut self, now: Instant) {
        self.my_proc_list.insert(self.my_id);

        self.memb_join_message_send();
        self.timers.arm(TimerKind::Join, now + self.config.join_timeout);
        self.timers
            .arm(TimerKind::Consensus, now + self.config.consensus_timeout);

        self.timers.cancel(TimerKind::TokenRetransmit);
        self.timers.cancel(TimerKind::TokenLoss);
        self.timers.cancel(TimerKind::MergeDetect);

        let me = self.my_id;
        self.consensus_set.clear();
        self.memb_consensus_set(&me);

        log::info!("[memb] {} entering GATHER state", self.my_id);
        self.state = MembState::Gather;
    }

    fn memb_state_commit_enter(&mut self, token: &mut CommitToken, now: Instant) {
        self.ring_save();
        self.old_ring_state_save();

        self.memb_state_commit_token_update(token);
        self.memb_state_commit_token_send(token);
        self.memb_ring_id_store(token.ring_id);

        self.timers.cancel(TimerKind::Join);
        self.timers.cancel(TimerKind::Consensus);
        self.reset_token_timeout(now);
        self.reset_token_retransmit_timeout(now);

        log::info!("[memb] {} entering COMMIT state", self.my_id);
        self.state = MembState::Commit;
    }

    fn memb_state_recovery_enter(&mut self, token: &mut CommitToken, now: Instant) {
        self.my_high_ring_delivered = 0;
        self.recovery_sort_queue.reinit(SEQNO_START_MSG);
        self.retrans_message_queue.clear();
        let mut low_ring_aru = self.old_ring_state_high_seq_received;

        // Second rotation: distribute the completed member states.
        self.memb_state_commit_token_send(token);
        self.my_token_seq = SEQNO_START_TOKEN.wrapping_sub(1);

        self.my_new_memb.assign(&token.addr);
        self.my_trans_memb = self.my_new_memb.intersect(&self.my_memb);

        for (i, addr) in token.addr.iter().enumerate() {
            let entry = &token.memb_list[i];
            log::info!(
                "[memb] {} position [{}] member {}: prior ring {} aru {:x} \
                 high delivered {:x} received {}",
                self.my_id,
                i,
                addr,
                entry.ring_id,
                entry.aru,
                entry.high_delivered,
                entry.received_flg
            );
            debug_assert!(entry.is_set(), "commit token rotated without a stamp");
        }

        // Messages from the prior ring are delivered on behalf of the whole
        // transitional membership.
        self.my_deliver_memb = self.my_trans_memb.clone();

        // Common cut over the prior ring: lowest aru and highest delivery
        // point among transitional members that share our old ring id.
        for (i, addr) in token.addr.iter().enumerate() {
            let entry = &token.memb_list[i];
            if self.my_deliver_memb.contains(addr) && entry.ring_id == self.my_old_ring_id {
                if low_ring_aru == 0 || seq_lt(entry.aru, low_ring_aru) {
                    low_ring_aru = entry.aru;
                }
                if seq_lt(self.my_high_ring_delivered, entry.high_delivered) {
                    self.my_high_ring_delivered = entry.high_delivered;
                }
            }
        }

        // Re-originate every prior-ring message above the cut that this
        // processor holds, encapsulated into new-ring frames.
        let range = self
            .old_ring_state_high_seq_received
            .wrapping_sub(low_ring_aru);
        debug_assert!(range < 1024, "recovery range diverged");
        log::info!(
            "[memb] {} copying prior ring messages {:x}-{:x} for recovery, \
             high ring delivered {:x}",
            self.my_id,
            low_ring_aru.wrapping_add(1),
            self.old_ring_state_high_seq_received,
            self.my_high_ring_delivered
        );
        let mut originated = 0;
        for i in 1..=range {
            if self.retrans_message_queue.len() >= RETRANS_MESSAGE_QUEUE_SIZE_MAX {
                log::warn!(
                    "[memb] {} recovery queue full, remaining prior ring \
                     messages left for retransmission",
                    self.my_id
                );
                break;
            }
            let seq = low_ring_aru.wrapping_add(i);
            let inner_frame = match self.regular_sort_queue.get(seq) {
                Some(item) => item.frame.clone(),
                None => continue,
            };
            match McastHeader::decode(&inner_frame) {
                Ok(mut outer) => {
                    outer.header.encapsulated = true;
                    outer.header.nodeid = self.my_id.nodeid;
                    outer.ring_id = self.my_ring_id;
                    self.retrans_message_queue.push_back(PendingMessage {
                        header: outer,
                        payload: inner_frame,
                    });
                    originated += 1;
                }
                Err(e) => {
                    log::error!(
                        "[memb] {} stored frame at {:x} is undecodable: {}",
                        self.my_id,
                        seq,
                        e
                    );
                }
            }
        }
        log::info!("[memb] {} originated {} messages for recovery", self.my_id, originated);

        self.my_aru = SEQNO_START_MSG;
        self.my_aru_count = 0;
        self.my_seq_unchanged = 0;
        self.my_high_seq_received = SEQNO_START_MSG;
        self.my_install_seq = SEQNO_START_MSG;
        self.last_released = SEQNO_START_MSG;
        self.my_retrans_flg_count = 0;
        self.my_rotation_counter = 0;

        self.reset_token_timeout(now);
        self.reset_token_retransmit_timeout(now);

        log::info!("[memb] {} entering RECOVERY state", self.my_id);
        self.state = MembState::Recovery;
    }

    pub(crate) fn memb_state_operational_enter(&mut self) {
        self.old_ring_state_saved = false;
        self.ring_saved = false;
        self.deliver_messages_from_recovery_to_regular();

        log::debug!(
            "[memb] {} delivering prior ring {:x} to {:x}",
            self.my_id,
            self.my_high_delivered.wrapping_add(1),
            self.old_ring_state_high_seq_received
        );

        // Deliver the prior ring's tail under its own counters; the new
        // ring's aru comes back once the transition is reported.
        let aru_save = self.my_aru;
        self.my_aru = self.old_ring_state_aru;

        let end_point = self.old_ring_state_high_seq_received;
        self.messages_deliver_to_app(false, end_point, false);

        let left = self.my_memb.subtract(&self.my_trans_memb);
        let joined = self.my_new_memb.subtract(&self.my_trans_memb);

        let ring_id = self.my_ring_id;
        let trans_members = self.my_trans_memb.as_slice().to_vec();
        let left_members = left.as_slice().to_vec();
        (self.confchg_fn)(
            super::ConfigurationType::Transitional,
            &trans_members,
            &left_members,
            &[],
            &ring_id,
        );

        // Remaining prior-ring messages: holes are legitimate here, and
        // only transitional members' messages are delivered.
        self.messages_deliver_to_app(true, end_point, false);
        self.my_aru = aru_save;

        let new_members = self.my_new_memb.as_slice().to_vec();
        let joined_members = joined.as_slice().to_vec();
        (self.confchg_fn)(
            super::ConfigurationType::Regular,
            &new_members,
            &[],
            &joined_members,
            &ring_id,
        );

        // Install the new membership; the recovery queue becomes the
        // regular queue with its new-ring sequencing.
        self.my_memb = self.my_new_memb.clone();
        self.last_released = SEQNO_START_MSG;
        self.my_set_retrans_flg = false;
        self.regular_sort_queue.copy_from(&self.recovery_sort_queue);
        self.my_last_aru = SEQNO_START_MSG;
        self.my_safe_point = SEQNO_START_MSG;

        self.my_proc_list = self.my_new_memb.clone();
        self.my_failed_list.clear();
        self.my_high_delivered = self.my_aru;

        log::info!(
            "[memb] {} entering OPERATIONAL state, ring {} with {} members",
            self.my_id,
            self.my_ring_id,
            self.my_memb.len()
        );
        self.state = MembState::Operational;
    }

    // ===================================================================
    // Inbound membership frames
    // ===================================================================

    /// Digest one JOIN. Returns true when the merge branch pushed us back
    /// into gather.
    fn memb_join_process(
        &mut self,
        join: &JoinMsg,
        system_from: &ProcessorId,
        now: Instant,
    ) -> bool {
        let proc = MemberList::from_slice(&join.proc_list);
        let failed = MemberList::from_slice(&join.failed_list);

        if proc.set_eq(&self.my_proc_list) && failed.set_eq(&self.my_failed_list) {
            // The sender sees exactly what we see.
            self.memb_consensus_set(system_from);

            if self.memb_consensus_agreed() && self.memb_lowest_in_config() {
                let mut token = self.memb_state_commit_token_create();
                self.memb_state_commit_enter(&mut token, now);
            }
            false
        } else if proc.is_subset_of(&self.my_proc_list)
            && failed.is_subset_of(&self.my_failed_list)
        {
            // Nothing new; the sender will catch up from our broadcasts.
            false
        } else if self.my_failed_list.contains(system_from) {
            // Stale view from a processor we have already written off.
            false
        } else {
            self.my_proc_list.merge(&join.proc_list);
            if failed.contains(&self.my_id) {
                // A processor that failed us cannot be agreed with; fail it
                // back rather than importing its view of us.
                self.my_failed_list.insert(*system_from);
            } else {
                self.my_failed_list.merge(&join.failed_list);
            }
            self.memb_state_gather_enter(now);
            true
        }
    }

    pub(crate) fn message_handler_memb_join(
        &mut self,
        system_from: &ProcessorId,
        join: &JoinMsg,
        now: Instant,
    ) {
        if self.token_ring_id_seq < join.ring_seq {
            self.token_ring_id_seq = join.ring_seq;
        }

        match self.state {
            MembState::Operational => {
                let gather_entered = self.memb_join_process(join, system_from, now);
                if !gather_entered {
                    self.memb_state_gather_enter(now);
                }
            }
            MembState::Gather => {
                self.memb_join_process(join, system_from, now);
            }
            MembState::Commit => {
                if self.my_new_memb.contains(system_from)
                    && join.ring_seq >= self.my_ring_id.seq
                {
                    self.memb_join_process(join, system_from, now);
                    self.memb_state_gather_enter(now);
                }
            }
            MembState::Recovery => {
                if self.my_new_memb.contains(system_from)
                    && join.ring_seq >= self.my_ring_id.seq
                {
                    self.ring_state_restore();
                    self.memb_join_process(join, system_from, now);
                    self.memb_state_gather_enter(now);
                }
            }
        }
    }

    pub(crate) fn message_handler_merge_detect(
        &mut self,
        system_from: &ProcessorId,
        merge: &MergeDetectMsg,
        now: Instant,
    ) {
        if merge.ring_id == self.my_ring_id {
            return;
        }

        match self.state {
            MembState::Operational => {
                self.my_proc_list.insert(*system_from);
                self.memb_state_gather_enter(now);
            }
            MembState::Gather => {
                if !self.my_proc_list.contains(system_from) {
                    self.my_proc_list.insert(*system_from);
                    self.memb_state_gather_enter(now);
                }
            }
            MembState::Commit | MembState::Recovery => {}
        }
    }

    pub(crate) fn message_handler_commit_token(
        &mut self,
        _system_from: &ProcessorId,
        mut token: CommitToken,
        now: Instant,
    ) {
        match self.state {
            MembState::Operational => {
                // An installed ring ignores stray commit tokens.
            }
            MembState::Gather => {
                let live = self.my_proc_list.subtract(&self.my_failed_list);
                let token_membs = MemberList::from_slice(&token.addr);
                if token_membs.set_eq(&live) && token.ring_id.seq > self.my_ring_id.seq {
                    self.memb_state_commit_enter(&mut token, now);
                }
            }
            MembState::Commit => {
                if token.ring_id == self.my_ring_id {
                    self.memb_state_recovery_enter(&mut token, now);
                }
            }
            MembState::Recovery => {
                // Second rotation returned to the representative: the new
                // ring is fully informed, start the ORF token.
                if self.my_id == self.my_ring_id.rep {
                    log::info!("[memb] {} sending initial ORF token", self.my_id);
                    self.orf_token_send_initial();
                    self.reset_token_timeout(now);
                    self.reset_token_retransmit_timeout(now);
                }
            }
        }
    }
}
