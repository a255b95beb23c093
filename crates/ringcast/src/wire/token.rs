// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! The two token frames: the rotating ORF token and the membership commit
//! token.
//!
//! The ORF token is the single rotating authority for sequence assignment,
//! retransmit requests and flow control. The commit token rotates twice
//! around a forming ring, collecting each member's prior-ring state so that
//! recovery can compute the common cut.

use super::{
    FrameReader, FrameWriter, MessageType, RingId, TotemHeader, WireError, PROCESSOR_ID_LEN,
    RING_ID_LEN, TOTEM_HEADER_LEN,
};
use crate::config::{PROCESSOR_COUNT_MAX, RETRANSMIT_ENTRIES_MAX};
use crate::member::ProcessorId;

/// One retransmit request riding the token: a ring-qualified sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtrItem {
    pub ring_id: RingId,
    pub seq: u32,
}

const RTR_ITEM_LEN: usize = RING_ID_LEN + 4;

/// The rotating Ordering/Reliability/Flow-control token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrfToken {
    pub header: TotemHeader,
    /// Highest message sequence assigned on this ring.
    pub seq: u32,
    /// Token circulation counter; detects retransmitted tokens.
    pub token_seq: u32,
    /// All-received-up-to sequence across the ring.
    pub aru: u32,
    /// Processor that last lowered `aru`; zero when the ring is caught up.
    pub aru_addr: ProcessorId,
    pub ring_id: RingId,
    /// Flow-control count: multicasts plus retransmits on the last visit.
    pub fcc: u16,
    /// Set while recovery re-origination traffic is still outstanding.
    pub retrans_flg: bool,
    /// Outstanding retransmit requests, at most
    /// [`RETRANSMIT_ENTRIES_MAX`](crate::config::RETRANSMIT_ENTRIES_MAX).
    pub rtr_list: Vec<RtrItem>,
}

impl OrfToken {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(
            TOTEM_HEADER_LEN
                + 12
                + PROCESSOR_ID_LEN
                + RING_ID_LEN
                + 7
                + self.rtr_list.len() * RTR_ITEM_LEN,
        );
        w.header(MessageType::OrfToken, false, self.header.nodeid);
        w.u32(self.seq);
        w.u32(self.token_seq);
        w.u32(self.aru);
        w.processor_id(&self.aru_addr);
        w.ring_id(&self.ring_id);
        w.u16(self.fcc);
        w.u8(u8::from(self.retrans_flg));
        w.u32(self.rtr_list.len() as u32);
        for item in &self.rtr_list {
            w.ring_id(&item.ring_id);
            w.u32(item.seq);
        }
        w.into_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (mut r, header) = FrameReader::begin(frame)?;
        let seq = r.u32()?;
        let token_seq = r.u32()?;
        let aru = r.u32()?;
        let aru_addr = r.processor_id()?;
        let ring_id = r.ring_id()?;
        let fcc = r.u16()?;
        let retrans_flg = r.u8()? != 0;
        let entries = r.u32()?;
        if entries as usize > RETRANSMIT_ENTRIES_MAX {
            return Err(WireError::CountOutOfRange(entries));
        }
        let mut rtr_list = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            let ring_id = r.ring_id()?;
            let seq = r.u32()?;
            rtr_list.push(RtrItem { ring_id, seq });
        }
        Ok(Self {
            header,
            seq,
            token_seq,
            aru,
            aru_addr,
            ring_id,
            fcc,
            retrans_flg,
            rtr_list,
        })
    }
}

/// Prior-ring state one member stamps into its commit-token slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitTokenMembEntry {
    /// Ring the member is coming from.
    pub ring_id: RingId,
    pub aru: u32,
    pub high_delivered: u32,
    pub received_flg: bool,
}

impl CommitTokenMembEntry {
    /// Placeholder before the owning member has stamped its state.
    #[must_use]
    pub const fn unset() -> Self {
        Self {
            ring_id: RingId::zero(),
            aru: 0,
            high_delivered: 0,
            received_flg: false,
        }
    }

    /// Whether the owning member has stamped its state yet.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.ring_id.rep.is_zero()
    }
}

const MEMB_ENTRY_LEN: usize = RING_ID_LEN + 9;

/// The membership commit token.
///
/// Created by the representative of an agreed gather set; rotates the new
/// membership in address order. `memb_index` names the slot of the member
/// that forwarded the token; each receiver stamps the following slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitToken {
    pub header: TotemHeader,
    pub token_seq: u32,
    /// The ring being installed.
    pub ring_id: RingId,
    pub retrans_flg: bool,
    /// Rotation position; starts at `addr.len() - 1` so the creator stamps
    /// slot 0.
    pub memb_index: i32,
    /// New membership in address (rotation) order.
    pub addr: Vec<ProcessorId>,
    /// Per-member prior-ring state, parallel to `addr`.
    pub memb_list: Vec<CommitTokenMembEntry>,
}

impl CommitToken {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(
            TOTEM_HEADER_LEN
                + RING_ID_LEN
                + 13
                + self.addr.len() * (PROCESSOR_ID_LEN + MEMB_ENTRY_LEN),
        );
        w.header(MessageType::CommitToken, false, self.header.nodeid);
        w.u32(self.token_seq);
        w.ring_id(&self.ring_id);
        w.u8(u8::from(self.retrans_flg));
        w.i32(self.memb_index);
        w.u32(self.addr.len() as u32);
        for id in &self.addr {
            w.processor_id(id);
        }
        for entry in &self.memb_list {
            w.ring_id(&entry.ring_id);
            w.u32(entry.aru);
            w.u32(entry.high_delivered);
            w.u8(u8::from(entry.received_flg));
        }
        w.into_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (mut r, header) = FrameReader::begin(frame)?;
        let token_seq = r.u32()?;
        let ring_id = r.ring_id()?;
        let retrans_flg = r.u8()? != 0;
        let memb_index = r.i32()?;
        let entries = r.u32()?;
        if entries == 0 || entries as usize > PROCESSOR_COUNT_MAX {
            return Err(WireError::CountOutOfRange(entries));
        }
        let mut addr = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            addr.push(r.processor_id()?);
        }
        let mut memb_list = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            let ring_id = r.ring_id()?;
            let aru = r.u32()?;
            let high_delivered = r.u32()?;
            let received_flg = r.u8()? != 0;
            memb_list.push(CommitTokenMembEntry {
                ring_id,
                aru,
                high_delivered,
                received_flg,
            });
        }
        Ok(Self {
            header,
            token_seq,
            ring_id,
            retrans_flg,
            memb_index,
            addr,
            memb_list,
        })
    }
}
