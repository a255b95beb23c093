// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Wire codec for the six totem frame types.
//!
//! Every frame starts with the 8-byte totem header: one type byte, one
//! encapsulation byte, the 16-bit endian detector, and the originator's
//! nodeid. Frames are emitted big-endian; the detector lets a receiver spot
//! a peer of the opposite byte order and flip every multi-byte field on
//! decode. Conversion is total: the same field readers serve both byte
//! orders, so there is no per-type swap routine to fall out of sync.
//!
//! Codec failures (truncated frame, unknown type, counts beyond protocol
//! limits) surface as [`WireError`]; the dispatch layer logs and drops the
//! frame - faults are assumed benign.

mod token;

pub use token::{CommitToken, CommitTokenMembEntry, OrfToken, RtrItem};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::PROCESSOR_COUNT_MAX;
use crate::member::ProcessorId;

// =======================================================================
// Layout constants
// =======================================================================

/// Endian detector as written by this implementation.
pub const ENDIAN_LOCAL: u16 = 0xff22;

/// Totem header: type(1) + encapsulated(1) + detector(2) + nodeid(4).
pub const TOTEM_HEADER_LEN: usize = 8;

/// Processor identity: nodeid(4) + family(2) + address(16).
pub const PROCESSOR_ID_LEN: usize = 22;

/// Ring identifier: representative(22) + sequence(8).
pub const RING_ID_LEN: usize = PROCESSOR_ID_LEN + 8;

/// Fixed prefix of a multicast frame, before the payload.
pub const MCAST_HEADER_LEN: usize = TOTEM_HEADER_LEN + 4 + 4 + RING_ID_LEN + PROCESSOR_ID_LEN + 1;

const FAMILY_V4: u16 = 4;
const FAMILY_V6: u16 = 6;

// =======================================================================
// Errors
// =======================================================================

/// Why a frame failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Frame shorter than its fixed layout requires.
    Truncated,
    /// Type byte does not name a totem message.
    UnknownType(u8),
    /// Endian detector is neither byte order of the local constant.
    BadDetector(u16),
    /// Address family is neither IPv4 nor IPv6.
    BadAddressFamily(u16),
    /// Guarantee byte is neither agreed nor safe.
    BadGuarantee(u8),
    /// An entry count exceeds its protocol limit.
    CountOutOfRange(u32),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "frame truncated"),
            WireError::UnknownType(t) => write!(f, "unknown message type {t:#x}"),
            WireError::BadDetector(d) => write!(f, "unrecognized endian detector {d:#06x}"),
            WireError::BadAddressFamily(fam) => write!(f, "unknown address family {fam}"),
            WireError::BadGuarantee(g) => write!(f, "unknown delivery guarantee {g}"),
            WireError::CountOutOfRange(n) => write!(f, "entry count {n} beyond protocol limit"),
        }
    }
}

impl std::error::Error for WireError {}

// =======================================================================
// Header
// =======================================================================

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Ordering, Reliability, Flow-control token.
    OrfToken = 0,
    /// Ring-ordered multicast message.
    Mcast = 1,
    /// Another ring is visible and should merge.
    MergeDetect = 2,
    /// Membership join (proc and failed sets).
    Join = 3,
    /// Membership commit token.
    CommitToken = 4,
    /// Cancel a held token after new work arrives.
    HoldCancel = 5,
}

impl MessageType {
    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(MessageType::OrfToken),
            1 => Ok(MessageType::Mcast),
            2 => Ok(MessageType::MergeDetect),
            3 => Ok(MessageType::Join),
            4 => Ok(MessageType::CommitToken),
            5 => Ok(MessageType::HoldCancel),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// The 8-byte header shared by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotemHeader {
    pub msg_type: MessageType,
    /// Set on multicast frames that carry a prior-ring frame as payload.
    pub encapsulated: bool,
    /// Originator nodeid; never zero on a valid frame.
    pub nodeid: u32,
}

/// Delivery guarantee requested by the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Guarantee {
    /// Same messages in the same order on every live member.
    Agreed = 0,
    /// Agreed, plus delivery withheld until every origin-ring member is
    /// known to have received the message.
    Safe = 1,
}

impl Guarantee {
    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Guarantee::Agreed),
            1 => Ok(Guarantee::Safe),
            other => Err(WireError::BadGuarantee(other)),
        }
    }
}

/// Ring identifier: the representative plus a monotonically increasing
/// 64-bit sequence persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingId {
    pub rep: ProcessorId,
    pub seq: u64,
}

impl RingId {
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            rep: ProcessorId::zero(),
            seq: 0,
        }
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rep.addr, self.seq)
    }
}

// =======================================================================
// Byte-order plumbing
// =======================================================================

/// Byte order of a frame, derived from its endian detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Big,
    Little,
}

pub(crate) struct FrameWriter {
    buf: Vec<u8>,
    endian: Endian,
}

impl FrameWriter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            endian: Endian::Big,
        }
    }

    /// Writer emitting the opposite byte order; only codec totality tests
    /// build frames this way.
    #[cfg(test)]
    pub(crate) fn new_swapped(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            endian: Endian::Little,
        }
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub(crate) fn u32(&mut self, v: u32) {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub(crate) fn i32(&mut self, v: i32) {
        self.u32(v as u32);
    }

    pub(crate) fn u64(&mut self, v: u64) {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub(crate) fn header(&mut self, msg_type: MessageType, encapsulated: bool, nodeid: u32) {
        self.u8(msg_type as u8);
        self.u8(u8::from(encapsulated));
        self.u16(ENDIAN_LOCAL);
        self.u32(nodeid);
    }

    pub(crate) fn processor_id(&mut self, id: &ProcessorId) {
        self.u32(id.nodeid);
        let mut addr = [0u8; 16];
        match id.addr {
            IpAddr::V4(v4) => {
                self.u16(FAMILY_V4);
                addr[..4].copy_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.u16(FAMILY_V6);
                addr.copy_from_slice(&v6.octets());
            }
        }
        self.bytes(&addr);
    }

    pub(crate) fn ring_id(&mut self, ring_id: &RingId) {
        self.processor_id(&ring_id.rep);
        self.u64(ring_id.seq);
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> FrameReader<'a> {
    /// Start reading a frame: parses the totem header, fixing the byte
    /// order for everything that follows from the endian detector.
    pub(crate) fn begin(buf: &'a [u8]) -> Result<(Self, TotemHeader), WireError> {
        if buf.len() < TOTEM_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let detector = u16::from_be_bytes([buf[2], buf[3]]);
        let endian = if detector == ENDIAN_LOCAL {
            Endian::Big
        } else if detector == ENDIAN_LOCAL.swap_bytes() {
            Endian::Little
        } else {
            return Err(WireError::BadDetector(detector));
        };
        let mut reader = Self {
            buf,
            pos: 0,
            endian,
        };
        let msg_type = MessageType::from_u8(reader.u8()?)?;
        let encapsulated = reader.u8()? == 1;
        let _detector = reader.u16()?;
        let nodeid = reader.u32()?;
        Ok((
            reader,
            TotemHeader {
                msg_type,
                encapsulated,
                nodeid,
            },
        ))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        let raw = [b[0], b[1]];
        Ok(match self.endian {
            Endian::Big => u16::from_be_bytes(raw),
            Endian::Little => u16::from_le_bytes(raw),
        })
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(match self.endian {
            Endian::Big => u32::from_be_bytes(raw),
            Endian::Little => u32::from_le_bytes(raw),
        })
    }

    pub(crate) fn i32(&mut self) -> Result<i32, WireError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(match self.endian {
            Endian::Big => u64::from_be_bytes(raw),
            Endian::Little => u64::from_le_bytes(raw),
        })
    }

    pub(crate) fn processor_id(&mut self) -> Result<ProcessorId, WireError> {
        let nodeid = self.u32()?;
        let family = self.u16()?;
        let raw = self.take(16)?;
        let addr = match family {
            FAMILY_V4 => {
                let mut v4 = [0u8; 4];
                v4.copy_from_slice(&raw[..4]);
                IpAddr::V4(Ipv4Addr::from(v4))
            }
            FAMILY_V6 => {
                let mut v6 = [0u8; 16];
                v6.copy_from_slice(raw);
                IpAddr::V6(Ipv6Addr::from(v6))
            }
            other => return Err(WireError::BadAddressFamily(other)),
        };
        Ok(ProcessorId { nodeid, addr })
    }

    pub(crate) fn ring_id(&mut self) -> Result<RingId, WireError> {
        let rep = self.processor_id()?;
        let seq = self.u64()?;
        Ok(RingId { rep, seq })
    }
}

// =======================================================================
// Frame inspection helpers
// =======================================================================

/// Whether the frame was written by a peer of the opposite byte order.
/// This is the `needs_endian_conversion` flag handed to the deliver
/// callback; the payload itself is opaque to this layer.
#[must_use]
pub fn frame_is_swapped(frame: &[u8]) -> bool {
    frame.len() >= 4 && u16::from_be_bytes([frame[2], frame[3]]) != ENDIAN_LOCAL
}

// =======================================================================
// Multicast frame
// =======================================================================

/// Parsed fixed prefix of a multicast frame. The payload is the rest of
/// the raw frame, `frame[MCAST_HEADER_LEN..]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastHeader {
    pub header: TotemHeader,
    /// Ring sequence assigned by the token holder at origination.
    pub seq: u32,
    /// Originator-global counter; diagnostic only.
    pub this_seqno: i32,
    pub ring_id: RingId,
    pub source: ProcessorId,
    pub guarantee: Guarantee,
}

impl McastHeader {
    /// Build the header for a frame about to be originated.
    #[must_use]
    pub fn new(source: ProcessorId, guarantee: Guarantee) -> Self {
        Self {
            header: TotemHeader {
                msg_type: MessageType::Mcast,
                encapsulated: false,
                nodeid: source.nodeid,
            },
            seq: 0,
            this_seqno: 0,
            ring_id: RingId::zero(),
            source,
            guarantee,
        }
    }

    /// Encode the full frame: header prefix followed by `payload`.
    #[must_use]
    pub fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut w = FrameWriter::new(MCAST_HEADER_LEN + payload.len());
        self.write(&mut w);
        w.bytes(payload);
        w.into_vec()
    }

    fn write(&self, w: &mut FrameWriter) {
        w.header(
            MessageType::Mcast,
            self.header.encapsulated,
            self.header.nodeid,
        );
        w.u32(self.seq);
        w.i32(self.this_seqno);
        w.ring_id(&self.ring_id);
        w.processor_id(&self.source);
        w.u8(self.guarantee as u8);
    }

    /// Decode the fixed prefix of a multicast frame.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (mut r, header) = FrameReader::begin(frame)?;
        let seq = r.u32()?;
        let this_seqno = r.i32()?;
        let ring_id = r.ring_id()?;
        let source = r.processor_id()?;
        let guarantee = Guarantee::from_u8(r.u8()?)?;
        Ok(Self {
            header,
            seq,
            this_seqno,
            ring_id,
            source,
            guarantee,
        })
    }
}

// =======================================================================
// Membership frames
// =======================================================================

/// Membership join: the sender's view of candidates and failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMsg {
    pub header: TotemHeader,
    /// Highest ring sequence the sender has observed.
    pub ring_seq: u64,
    pub proc_list: Vec<ProcessorId>,
    pub failed_list: Vec<ProcessorId>,
}

impl JoinMsg {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(
            TOTEM_HEADER_LEN
                + 8
                + 8
                + (self.proc_list.len() + self.failed_list.len()) * PROCESSOR_ID_LEN,
        );
        w.header(MessageType::Join, false, self.header.nodeid);
        w.u64(self.ring_seq);
        w.u32(self.proc_list.len() as u32);
        w.u32(self.failed_list.len() as u32);
        for id in &self.proc_list {
            w.processor_id(id);
        }
        for id in &self.failed_list {
            w.processor_id(id);
        }
        w.into_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (mut r, header) = FrameReader::begin(frame)?;
        let ring_seq = r.u64()?;
        let proc_entries = r.u32()?;
        let failed_entries = r.u32()?;
        if proc_entries as usize > PROCESSOR_COUNT_MAX {
            return Err(WireError::CountOutOfRange(proc_entries));
        }
        if failed_entries as usize > PROCESSOR_COUNT_MAX {
            return Err(WireError::CountOutOfRange(failed_entries));
        }
        let mut proc_list = Vec::with_capacity(proc_entries as usize);
        for _ in 0..proc_entries {
            proc_list.push(r.processor_id()?);
        }
        let mut failed_list = Vec::with_capacity(failed_entries as usize);
        for _ in 0..failed_entries {
            failed_list.push(r.processor_id()?);
        }
        Ok(Self {
            header,
            ring_seq,
            proc_list,
            failed_list,
        })
    }
}

/// Advertises an installed ring so a disjoint ring can trigger a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeDetectMsg {
    pub header: TotemHeader,
    pub ring_id: RingId,
}

impl MergeDetectMsg {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(TOTEM_HEADER_LEN + RING_ID_LEN);
        w.header(MessageType::MergeDetect, false, self.header.nodeid);
        w.ring_id(&self.ring_id);
        w.into_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (mut r, header) = FrameReader::begin(frame)?;
        let ring_id = r.ring_id()?;
        Ok(Self { header, ring_id })
    }
}

/// Cancels a held token: new work arrived while the ring was idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldCancelMsg {
    pub header: TotemHeader,
    pub ring_id: RingId,
}

impl HoldCancelMsg {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(TOTEM_HEADER_LEN + RING_ID_LEN);
        w.header(MessageType::HoldCancel, false, self.header.nodeid);
        w.ring_id(&self.ring_id);
        w.into_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (mut r, header) = FrameReader::begin(frame)?;
        let ring_id = r.ring_id()?;
        Ok(Self { header, ring_id })
    }
}

// =======================================================================
// Dispatch
// =======================================================================

/// A decoded incoming frame. Multicast frames decode only their fixed
/// prefix; the caller keeps the raw bytes for storage and retransmission.
#[derive(Debug, Clone)]
pub enum Message {
    OrfToken(OrfToken),
    Mcast(McastHeader),
    MergeDetect(MergeDetectMsg),
    Join(JoinMsg),
    CommitToken(CommitToken),
    HoldCancel(HoldCancelMsg),
}

/// Decode any incoming frame by its type byte.
pub fn decode_message(frame: &[u8]) -> Result<Message, WireError> {
    if frame.is_empty() {
        return Err(WireError::Truncated);
    }
    match MessageType::from_u8(frame[0])? {
        MessageType::OrfToken => Ok(Message::OrfToken(OrfToken::decode(frame)?)),
        MessageType::Mcast => Ok(Message::Mcast(McastHeader::decode(frame)?)),
        MessageType::MergeDetect => Ok(Message::MergeDetect(MergeDetectMsg::decode(frame)?)),
        MessageType::Join => Ok(Message::Join(JoinMsg::decode(frame)?)),
        MessageType::CommitToken => Ok(Message::CommitToken(CommitToken::decode(frame)?)),
        MessageType::HoldCancel => Ok(Message::HoldCancel(HoldCancelMsg::decode(frame)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(nodeid: u32, last: u8) -> ProcessorId {
        ProcessorId::new(nodeid, IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    fn ring(seq: u64) -> RingId {
        RingId {
            rep: pid(1, 1),
            seq,
        }
    }

    #[test]
    fn test_mcast_header_len_matches_encoding() {
        let header = McastHeader::new(pid(3, 3), Guarantee::Agreed);
        let frame = header.encode_frame(b"");
        assert_eq!(frame.len(), MCAST_HEADER_LEN);
    }

    #[test]
    fn test_mcast_roundtrip() {
        let mut header = McastHeader::new(pid(3, 3), Guarantee::Safe);
        header.seq = 42;
        header.this_seqno = 7;
        header.ring_id = ring(8);
        let frame = header.encode_frame(b"hello ring");

        let decoded = McastHeader::decode(&frame).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(&frame[MCAST_HEADER_LEN..], b"hello ring");
        assert!(!frame_is_swapped(&frame));
    }

    #[test]
    fn test_join_roundtrip() {
        let msg = JoinMsg {
            header: TotemHeader {
                msg_type: MessageType::Join,
                encapsulated: false,
                nodeid: 2,
            },
            ring_seq: 12,
            proc_list: vec![pid(1, 1), pid(2, 2), pid(3, 3)],
            failed_list: vec![pid(3, 3)],
        };
        let decoded = JoinMsg::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_join_v6_member_roundtrip() {
        let v6 = ProcessorId::new(9, IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 9)));
        let msg = JoinMsg {
            header: TotemHeader {
                msg_type: MessageType::Join,
                encapsulated: false,
                nodeid: 9,
            },
            ring_seq: 0,
            proc_list: vec![v6],
            failed_list: vec![],
        };
        let decoded = JoinMsg::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded.proc_list[0], v6);
    }

    #[test]
    fn test_merge_detect_and_hold_cancel_roundtrip() {
        let header = TotemHeader {
            msg_type: MessageType::MergeDetect,
            encapsulated: false,
            nodeid: 5,
        };
        let merge = MergeDetectMsg {
            header,
            ring_id: ring(20),
        };
        assert_eq!(MergeDetectMsg::decode(&merge.encode()).expect("decode"), merge);

        let cancel = HoldCancelMsg {
            header: TotemHeader {
                msg_type: MessageType::HoldCancel,
                ..header
            },
            ring_id: ring(20),
        };
        assert_eq!(HoldCancelMsg::decode(&cancel.encode()).expect("decode"), cancel);
    }

    #[test]
    fn test_swapped_frame_decodes_identically() {
        // A frame written by a little-endian peer: the detector reads
        // swapped and every multi-byte field flips on decode.
        let mut w = FrameWriter::new_swapped(64);
        w.header(MessageType::MergeDetect, false, 0x1234_5678);
        w.ring_id(&ring(0x0102_0304_0506_0708));
        let frame = w.into_vec();

        assert!(frame_is_swapped(&frame));
        let decoded = MergeDetectMsg::decode(&frame).expect("decode");
        assert_eq!(decoded.header.nodeid, 0x1234_5678);
        assert_eq!(decoded.ring_id.seq, 0x0102_0304_0506_0708);
        assert_eq!(decoded.ring_id.rep, pid(1, 1));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let msg = MergeDetectMsg {
            header: TotemHeader {
                msg_type: MessageType::MergeDetect,
                encapsulated: false,
                nodeid: 5,
            },
            ring_id: ring(1),
        };
        let frame = msg.encode();
        for len in 0..frame.len() {
            assert_eq!(
                MergeDetectMsg::decode(&frame[..len]),
                Err(WireError::Truncated),
                "length {len} should be truncated"
            );
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut frame = MergeDetectMsg {
            header: TotemHeader {
                msg_type: MessageType::MergeDetect,
                encapsulated: false,
                nodeid: 5,
            },
            ring_id: ring(1),
        }
        .encode();
        frame[0] = 0x7f;
        assert!(matches!(
            decode_message(&frame),
            Err(WireError::UnknownType(0x7f))
        ));
    }

    #[test]
    fn test_bad_detector_rejected() {
        let mut frame = MergeDetectMsg {
            header: TotemHeader {
                msg_type: MessageType::MergeDetect,
                encapsulated: false,
                nodeid: 5,
            },
            ring_id: ring(1),
        }
        .encode();
        frame[2] = 0xab;
        frame[3] = 0xcd;
        assert!(matches!(
            MergeDetectMsg::decode(&frame),
            Err(WireError::BadDetector(0xabcd))
        ));
    }

    #[test]
    fn test_join_count_limit() {
        let msg = JoinMsg {
            header: TotemHeader {
                msg_type: MessageType::Join,
                encapsulated: false,
                nodeid: 2,
            },
            ring_seq: 0,
            proc_list: vec![pid(1, 1)],
            failed_list: vec![],
        };
        let mut frame = msg.encode();
        // Corrupt the proc count to exceed the processor limit.
        frame[16..20].copy_from_slice(&10_000u32.to_be_bytes());
        assert!(matches!(
            JoinMsg::decode(&frame),
            Err(WireError::CountOutOfRange(10_000))
        ));
    }

    #[test]
    fn test_dispatch_by_type() {
        let join = JoinMsg {
            header: TotemHeader {
                msg_type: MessageType::Join,
                encapsulated: false,
                nodeid: 2,
            },
            ring_seq: 3,
            proc_list: vec![pid(2, 2)],
            failed_list: vec![],
        };
        match decode_message(&join.encode()).expect("decode") {
            Message::Join(decoded) => assert_eq!(decoded, join),
            other => panic!("expected join, got {other:?}"),
        }
    }
}
