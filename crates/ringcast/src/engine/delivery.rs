// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! In-order delivery to the upper layer.
//!
//! `messages_deliver_to_app` walks the regular sort queue from the last
//! delivered sequence: in the operational path a hole stops delivery (the
//! retransmit machinery will fill it), in the transitional path (`skip`)
//! holes are legitimate and delivery is filtered to the transitional
//! membership. SAFE messages additionally wait for the token-proven
//! receipt watermark.
//!
//! The recovery drain decapsulates prior-ring messages recovered on the
//! new ring and replays them into the regular queue at their original
//! sequences, preserving the old ring's order across the installation.

use std::time::Instant;

use crate::config::SEQNO_START_MSG;
use crate::seq::{seq_lt, seq_lte};
use crate::timers::TimerKind;
use crate::wire::{self, Guarantee, McastHeader, MCAST_HEADER_LEN};

use super::{MembState, SortItem, TotemEngine};

impl TotemEngine {
    /// Handle a received multicast frame: queue it for ordered delivery,
    /// or treat a foreign ring's frame as a merge trigger.
    pub(crate) fn message_handler_mcast(
        &mut self,
        system_from: &crate::member::ProcessorId,
        mcast: &McastHeader,
        frame: &[u8],
        now: Instant,
    ) {
        // Hearing someone else's multicast proves the ring is moving; the
        // token retransmit can stand down.
        if *system_from != self.my_id {
            self.timers.cancel(TimerKind::TokenRetransmit);
        }

        // A foreign ring's message means that ring must merge with ours.
        if mcast.ring_id != self.my_ring_id {
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
            return;
        }

        log::debug!(
            "[delivery] {} received ring {} seq {:x}",
            self.my_id,
            mcast.ring_id,
            mcast.seq
        );

        let sort_queue = if self.state == MembState::Recovery {
            &mut self.recovery_sort_queue
        } else {
            &mut self.regular_sort_queue
        };
        if sort_queue.in_range(mcast.seq) && !sort_queue.inuse(mcast.seq) {
            sort_queue.add(
                mcast.seq,
                SortItem {
                    frame: frame.to_vec(),
                },
            );
            if seq_lt(self.my_high_seq_received, mcast.seq) {
                self.my_high_seq_received = mcast.seq;
            }
        }

        if self.state == MembState::Operational {
            self.update_aru();
            self.messages_deliver_to_app(false, self.my_high_seq_received, true);
        }
    }

    /// Deliver messages in `(my_high_delivered, end_point]` in sequence
    /// order. `skip` allows holes and filters to the transitional delivery
    /// membership; `enforce_safe` gates SAFE messages on the receipt
    /// watermark (operational path only).
    pub(crate) fn messages_deliver_to_app(
        &mut self,
        skip: bool,
        end_point: u32,
        enforce_safe: bool,
    ) {
        let range = end_point.wrapping_sub(self.my_high_delivered);
        debug_assert!(range < 10240, "delivery range diverged");
        log::debug!(
            "[delivery] {} delivering {:x} to {:x}",
            self.my_id,
            self.my_high_delivered,
            end_point
        );
        let stored_high_delivered = self.my_high_delivered;

        for i in 1..=range {
            let seq = stored_high_delivered.wrapping_add(i);

            if !self.regular_sort_queue.in_range(seq) {
                break;
            }
            let frame = match self.regular_sort_queue.get(seq) {
                Some(item) => item.frame.clone(),
                None if skip => {
                    // Transitional delivery legitimately skips sequences
                    // discarded by the recovery cut.
                    self.my_high_delivered = seq;
                    continue;
                }
                None => break,
            };

            let header = match McastHeader::decode(&frame) {
                Ok(header) => header,
                Err(e) => {
                    log::error!(
                        "[delivery] {} stored frame at {:x} is undecodable: {}",
                        self.my_id,
                        seq,
                        e
                    );
                    self.my_high_delivered = seq;
                    continue;
                }
            };

            // A SAFE message waits until a full token rotation has proven
            // every member received it.
            if enforce_safe
                && !skip
                && header.guarantee == Guarantee::Safe
                && !seq_lte(seq, self.my_safe_point)
            {
                break;
            }

            self.my_high_delivered = seq;

            if skip && !self.my_deliver_memb.contains(&header.source) {
                continue;
            }

            log::debug!(
                "[delivery] {} delivering seq {:x} from {}",
                self.my_id,
                seq,
                header.source
            );
            let swapped = wire::frame_is_swapped(&frame);
            (self.deliver_fn)(&header.source, &frame[MCAST_HEADER_LEN..], swapped);
        }

        self.my_received_flg = self.my_aru == self.my_high_seq_received;
    }

    /// Replay recovered prior-ring messages into the regular queue at
    /// their original sequences.
    pub(crate) fn deliver_messages_from_recovery_to_regular(&mut self) {
        let range = self.my_aru.wrapping_sub(SEQNO_START_MSG);
        log::debug!(
            "[delivery] {} recovery to regular {:x}-{:x}",
            self.my_id,
            SEQNO_START_MSG.wrapping_add(1),
            self.my_aru
        );

        for i in 1..=range {
            let seq = SEQNO_START_MSG.wrapping_add(i);
            let frame = match self.recovery_sort_queue.get(seq) {
                Some(item) => item.frame.clone(),
                None => continue,
            };
            let outer = match McastHeader::decode(&frame) {
                Ok(header) => header,
                Err(e) => {
                    log::error!(
                        "[delivery] {} recovered frame at {:x} is undecodable: {}",
                        self.my_id,
                        seq,
                        e
                    );
                    continue;
                }
            };

            // Everything multicast during recovery is a re-origination;
            // a bare message here is a protocol violation.
            assert!(
                outer.header.encapsulated,
                "recovery queue holds a non-encapsulated message"
            );

            let inner_frame = frame[MCAST_HEADER_LEN..].to_vec();
            let inner = match McastHeader::decode(&inner_frame) {
                Ok(header) => header,
                Err(e) => {
                    log::error!(
                        "[delivery] {} encapsulated frame at {:x} is undecodable: {}",
                        self.my_id,
                        seq,
                        e
                    );
                    continue;
                }
            };

            // Only messages from our own prior ring replay here; a member
            // arriving from a different ring recovers nothing of ours.
            if inner.ring_id == self.my_old_ring_id {
                if !self.regular_sort_queue.inuse(inner.seq) {
                    if self.regular_sort_queue.add(
                        inner.seq,
                        SortItem {
                            frame: inner_frame,
                        },
                    ) {
                        if seq_lt(self.old_ring_state_high_seq_received, inner.seq) {
                            self.old_ring_state_high_seq_received = inner.seq;
                        }
                    } else {
                        log::warn!(
                            "[delivery] {} recovered seq {:x} outside regular queue window",
                            self.my_id,
                            inner.seq
                        );
                    }
                }
            } else {
                log::info!(
                    "[delivery] {} not replaying seq {:x} from ring {}",
                    self.my_id,
                    inner.seq,
                    inner.ring_id
                );
            }
        }
    }
}
