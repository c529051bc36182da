//! # CMB Wire Format
//!
//! Seven fixed-layout packet kinds, all big-endian, each datagram fully
//! self-contained. Every packet opens with a 2-byte type tag:
//!
//! ```text
//! 0xCB00  RequestResource   keep-alive / parameter update, fetcher → provider
//! 0xCB01  Data              one FEC symbol of one block, provider → fetcher
//! 0xCB02  AckBlock          block decoded, fetcher → provider
//! 0xCB03  NackBlock         block stalled, fetcher → provider
//! 0xCB04  ShrinkRange       convergence update, fetcher → provider
//! 0xCB05  Error             fatal condition, provider → fetcher
//! 0xCB06  Feedback          TFRC receiver report, fetcher → provider
//! ```
//!
//! 24-bit and 48-bit integers are carried as truncated big-endian of a wider
//! unsigned. Decode failures are recoverable: the caller drops the datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::resource::ResourceId;
use crate::timestamp::Timestamp;

/// Size of the leading type tag.
pub const PACKET_TYPE_SIZE: usize = 2;

/// Recoverable wire decode failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown packet type 0x{0:04x}")]
    UnknownType(u16),
    #[error("datagram truncated")]
    Truncated,
    #[error("unknown error code {0}")]
    UnknownErrorCode(u16),
}

// ─── Packet Kinds ───────────────────────────────────────────────────────────

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketKind {
    RequestResource = 0xCB00,
    Data = 0xCB01,
    AckBlock = 0xCB02,
    NackBlock = 0xCB03,
    ShrinkRange = 0xCB04,
    Error = 0xCB05,
    Feedback = 0xCB06,
}

impl PacketKind {
    pub fn from_u16(tag: u16) -> Option<Self> {
        match tag {
            0xCB00 => Some(PacketKind::RequestResource),
            0xCB01 => Some(PacketKind::Data),
            0xCB02 => Some(PacketKind::AckBlock),
            0xCB03 => Some(PacketKind::NackBlock),
            0xCB04 => Some(PacketKind::ShrinkRange),
            0xCB05 => Some(PacketKind::Error),
            0xCB06 => Some(PacketKind::Feedback),
            _ => None,
        }
    }
}

// ─── Request ────────────────────────────────────────────────────────────────

/// Fetcher → provider: open a flow, and thereafter the periodic keep-alive
/// carrying the flow's current range and requested sending rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResource {
    /// Sender timestamp at transmission (ms, mod 2^24).
    pub timestamp: Timestamp,
    /// Requested pacing rate in bytes per second.
    pub sending_rate: u32,
    /// Current head of the fetcher's range.
    pub range_start: u64,
    /// Identity of the requested resource.
    pub resource_id: ResourceId,
    /// Current tail of the fetcher's range (exclusive).
    pub range_end: u64,
}

impl RequestResource {
    /// Field bytes after the type tag: 1 + 3 + 4 + 6 + 16 + 8 + 6.
    pub const FIELDS_SIZE: usize = 44;

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_u8(0); // reserved
        buf.put_uint(self.timestamp.as_millis() as u64, 3);
        buf.put_u32(self.sending_rate);
        buf.put_uint(self.range_start, 6);
        buf.put_slice(self.resource_id.hash());
        buf.put_u64(self.resource_id.length());
        buf.put_uint(self.range_end, 6);
    }

    fn decode_fields(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::FIELDS_SIZE {
            return Err(WireError::Truncated);
        }
        buf.advance(1); // reserved
        let timestamp = Timestamp::from_millis(buf.get_uint(3));
        let sending_rate = buf.get_u32();
        let range_start = buf.get_uint(6);
        let mut hash = [0u8; 16];
        buf.copy_to_slice(&mut hash);
        let length = buf.get_u64();
        let range_end = buf.get_uint(6);
        Ok(RequestResource {
            timestamp,
            sending_rate,
            range_start,
            resource_id: ResourceId::new(hash, length),
            range_end,
        })
    }
}

// ─── Data ───────────────────────────────────────────────────────────────────

/// Provider → fetcher: one FEC symbol of one block, tagged with the echoed
/// receiver timestamp and the hold delay for RTT recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    /// Block the symbol belongs to.
    pub block_id: u64,
    /// Echo of the most recent keep-alive's timestamp.
    pub receiver_timestamp: Timestamp,
    /// Milliseconds between receiving that keep-alive and this send.
    pub delay: u16,
    /// Codec header plus symbol payload.
    pub symbol: Bytes,
}

impl Data {
    /// Header bytes after the type tag: 6 + 1 + 3 + 2.
    pub const HEADER_SIZE: usize = 12;

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_uint(self.block_id, 6);
        buf.put_u8(0); // reserved
        buf.put_uint(self.receiver_timestamp.as_millis() as u64, 3);
        buf.put_u16(self.delay);
        buf.put_slice(&self.symbol);
    }

    fn decode_fields(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let block_id = buf.get_uint(6);
        buf.advance(1); // reserved
        let receiver_timestamp = Timestamp::from_millis(buf.get_uint(3));
        let delay = buf.get_u16();
        Ok(Data {
            block_id,
            receiver_timestamp,
            delay,
            symbol: Bytes::copy_from_slice(buf),
        })
    }
}

// ─── Acknowledgements ───────────────────────────────────────────────────────

/// Fetcher → provider: the block has been decoded in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub block_id: u64,
}

impl AckBlock {
    pub const FIELDS_SIZE: usize = 6;

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_uint(self.block_id, 6);
    }

    fn decode_fields(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::FIELDS_SIZE {
            return Err(WireError::Truncated);
        }
        Ok(AckBlock {
            block_id: buf.get_uint(6),
        })
    }
}

/// Fetcher → provider: a block is stalled; `packets_received` lets the
/// provider size the repair burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackBlock {
    pub block_id: u64,
    pub packets_received: u16,
}

impl NackBlock {
    pub const FIELDS_SIZE: usize = 8;

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_uint(self.block_id, 6);
        buf.put_u16(self.packets_received);
    }

    fn decode_fields(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::FIELDS_SIZE {
            return Err(WireError::Truncated);
        }
        Ok(NackBlock {
            block_id: buf.get_uint(6),
            packets_received: buf.get_u16(),
        })
    }
}

// ─── Convergence ────────────────────────────────────────────────────────────

/// Fetcher → provider: the flow's current `[start, end)`; the provider
/// tightens its own range to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkRange {
    pub range_start: u64,
    pub range_end: u64,
}

impl ShrinkRange {
    pub const FIELDS_SIZE: usize = 12;

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_uint(self.range_start, 6);
        buf.put_uint(self.range_end, 6);
    }

    fn decode_fields(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::FIELDS_SIZE {
            return Err(WireError::Truncated);
        }
        Ok(ShrinkRange {
            range_start: buf.get_uint(6),
            range_end: buf.get_uint(6),
        })
    }
}

// ─── Error ──────────────────────────────────────────────────────────────────

/// Fatal protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    ResourceNotFound = 0,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::ResourceNotFound),
            _ => None,
        }
    }
}

/// Provider → fetcher: fatal mismatch, the flow is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub code: ErrorCode,
}

impl Error {
    pub const FIELDS_SIZE: usize = 2;

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_u16(self.code as u16);
    }

    fn decode_fields(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::FIELDS_SIZE {
            return Err(WireError::Truncated);
        }
        let raw = buf.get_u16();
        let code = ErrorCode::from_u16(raw).ok_or(WireError::UnknownErrorCode(raw))?;
        Ok(Error { code })
    }
}

// ─── Feedback ───────────────────────────────────────────────────────────────

/// Fetcher → provider: TFRC receiver report (RFC 5348 §3.2.2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    /// Milliseconds between receiving the echoed packet and this send.
    pub delay: u16,
    /// Echo of the sender timestamp of the most recent Data packet.
    pub timestamp: Timestamp,
    /// Estimated receive rate since the last feedback, bytes per second.
    pub receive_rate: u32,
    /// Loss event rate `p` in `[0, 1]`.
    pub loss_event_rate: f32,
}

impl Feedback {
    /// Field bytes after the type tag: 2 + 3 + 1 + 4 + 4.
    pub const FIELDS_SIZE: usize = 14;

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_u16(self.delay);
        buf.put_uint(self.timestamp.as_millis() as u64, 3);
        buf.put_u8(0); // reserved
        buf.put_u32(self.receive_rate);
        buf.put_f32(self.loss_event_rate);
    }

    fn decode_fields(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::FIELDS_SIZE {
            return Err(WireError::Truncated);
        }
        let delay = buf.get_u16();
        let timestamp = Timestamp::from_millis(buf.get_uint(3));
        buf.advance(1); // reserved
        Ok(Feedback {
            delay,
            timestamp,
            receive_rate: buf.get_u32(),
            loss_event_rate: buf.get_f32(),
        })
    }
}

// ─── Tagged Union ───────────────────────────────────────────────────────────

/// A decoded CMB packet, one variant per wire kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    RequestResource(RequestResource),
    Data(Data),
    AckBlock(AckBlock),
    NackBlock(NackBlock),
    ShrinkRange(ShrinkRange),
    Error(Error),
    Feedback(Feedback),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::RequestResource(_) => PacketKind::RequestResource,
            Packet::Data(_) => PacketKind::Data,
            Packet::AckBlock(_) => PacketKind::AckBlock,
            Packet::NackBlock(_) => PacketKind::NackBlock,
            Packet::ShrinkRange(_) => PacketKind::ShrinkRange,
            Packet::Error(_) => PacketKind::Error,
            Packet::Feedback(_) => PacketKind::Feedback,
        }
    }

    /// Serialize into a fresh buffer, type tag first.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PACKET_TYPE_SIZE + 64);
        buf.put_u16(self.kind() as u16);
        match self {
            Packet::RequestResource(p) => p.encode_fields(&mut buf),
            Packet::Data(p) => p.encode_fields(&mut buf),
            Packet::AckBlock(p) => p.encode_fields(&mut buf),
            Packet::NackBlock(p) => p.encode_fields(&mut buf),
            Packet::ShrinkRange(p) => p.encode_fields(&mut buf),
            Packet::Error(p) => p.encode_fields(&mut buf),
            Packet::Feedback(p) => p.encode_fields(&mut buf),
        }
        buf
    }

    /// Decode one datagram. Any failure is recoverable: log and drop.
    pub fn decode(datagram: &[u8]) -> Result<Packet, WireError> {
        if datagram.len() < PACKET_TYPE_SIZE {
            return Err(WireError::Truncated);
        }
        let tag = u16::from_be_bytes([datagram[0], datagram[1]]);
        let kind = PacketKind::from_u16(tag).ok_or(WireError::UnknownType(tag))?;
        let fields = &datagram[PACKET_TYPE_SIZE..];
        Ok(match kind {
            PacketKind::RequestResource => {
                Packet::RequestResource(RequestResource::decode_fields(fields)?)
            }
            PacketKind::Data => Packet::Data(Data::decode_fields(fields)?),
            PacketKind::AckBlock => Packet::AckBlock(AckBlock::decode_fields(fields)?),
            PacketKind::NackBlock => Packet::NackBlock(NackBlock::decode_fields(fields)?),
            PacketKind::ShrinkRange => Packet::ShrinkRange(ShrinkRange::decode_fields(fields)?),
            PacketKind::Error => Packet::Error(Error::decode_fields(fields)?),
            PacketKind::Feedback => Packet::Feedback(Feedback::decode_fields(fields)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(packet: Packet) -> Packet {
        Packet::decode(&packet.encode()).expect("roundtrip decode")
    }

    // ─── Per-Kind Roundtrips ────────────────────────────────────────────

    #[test]
    fn request_resource_roundtrip() {
        let packet = Packet::RequestResource(RequestResource {
            timestamp: Timestamp::from_millis(123_456),
            sending_rate: 250_000,
            range_start: 1,
            resource_id: ResourceId::of(b"a resource"),
            range_end: 7,
        });
        assert_eq!(roundtrip(packet.clone()), packet);
        assert_eq!(
            packet.encode().len(),
            PACKET_TYPE_SIZE + RequestResource::FIELDS_SIZE
        );
    }

    #[test]
    fn data_roundtrip() {
        let packet = Packet::Data(Data {
            block_id: 42,
            receiver_timestamp: Timestamp::from_millis(999),
            delay: 17,
            symbol: Bytes::from_static(b"\x00\x00\x00\x01symbol-bytes"),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn data_empty_symbol_roundtrip() {
        let packet = Packet::Data(Data {
            block_id: 1,
            receiver_timestamp: Timestamp::from_millis(0),
            delay: 0,
            symbol: Bytes::new(),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
        assert_eq!(packet.encode().len(), PACKET_TYPE_SIZE + Data::HEADER_SIZE);
    }

    #[test]
    fn ack_nack_roundtrip() {
        let ack = Packet::AckBlock(AckBlock { block_id: 9 });
        assert_eq!(roundtrip(ack.clone()), ack);

        let nack = Packet::NackBlock(NackBlock {
            block_id: 3,
            packets_received: 57,
        });
        assert_eq!(roundtrip(nack.clone()), nack);
    }

    #[test]
    fn shrink_range_roundtrip() {
        let packet = Packet::ShrinkRange(ShrinkRange {
            range_start: 6,
            range_end: 3,
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn error_roundtrip() {
        let packet = Packet::Error(Error {
            code: ErrorCode::ResourceNotFound,
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn feedback_roundtrip() {
        let packet = Packet::Feedback(Feedback {
            delay: 12,
            timestamp: Timestamp::from_millis(500_000),
            receive_rate: 1_000_000,
            loss_event_rate: 0.031_25,
        });
        assert_eq!(roundtrip(packet.clone()), packet);
        assert_eq!(
            packet.encode().len(),
            PACKET_TYPE_SIZE + Feedback::FIELDS_SIZE
        );
    }

    // ─── Decode Failures ────────────────────────────────────────────────

    #[test]
    fn unknown_type_rejected() {
        let err = Packet::decode(&[0xCB, 0x07, 0, 0]).unwrap_err();
        assert_eq!(err, WireError::UnknownType(0xCB07));
    }

    #[test]
    fn truncated_rejected() {
        assert_eq!(Packet::decode(&[0xCB]).unwrap_err(), WireError::Truncated);

        let ack = Packet::AckBlock(AckBlock { block_id: 1 }).encode();
        assert_eq!(
            Packet::decode(&ack[..ack.len() - 1]).unwrap_err(),
            WireError::Truncated
        );
    }

    #[test]
    fn trailing_garbage_rejected_on_fixed_size_packets() {
        let mut ack = Packet::AckBlock(AckBlock { block_id: 1 }).encode();
        ack.put_u8(0xFF);
        assert_eq!(Packet::decode(&ack).unwrap_err(), WireError::Truncated);
    }

    #[test]
    fn unknown_error_code_rejected() {
        let raw = [0xCB, 0x05, 0x00, 0x99];
        assert_eq!(
            Packet::decode(&raw).unwrap_err(),
            WireError::UnknownErrorCode(0x99)
        );
    }

    // ─── Properties ─────────────────────────────────────────────────────

    proptest! {
        #[test]
        fn proptest_request_resource_roundtrip(
            ts in 0u64..(1 << 24),
            rate in 0u32..=u32::MAX,
            start in 0u64..(1 << 48),
            end in 0u64..(1 << 48),
            length in 0u64..=u64::MAX,
            hash in proptest::array::uniform16(0u8..=255),
        ) {
            let packet = Packet::RequestResource(RequestResource {
                timestamp: Timestamp::from_millis(ts),
                sending_rate: rate,
                range_start: start,
                resource_id: ResourceId::new(hash, length),
                range_end: end,
            });
            prop_assert_eq!(roundtrip(packet.clone()), packet);
        }

        #[test]
        fn proptest_data_roundtrip(
            block_id in 0u64..(1 << 48),
            ts in 0u64..(1 << 24),
            delay in 0u16..=u16::MAX,
            symbol in proptest::collection::vec(0u8..=255, 0..600),
        ) {
            let packet = Packet::Data(Data {
                block_id,
                receiver_timestamp: Timestamp::from_millis(ts),
                delay,
                symbol: Bytes::from(symbol),
            });
            prop_assert_eq!(roundtrip(packet.clone()), packet);
        }

        #[test]
        fn proptest_short_datagrams_never_panic(raw in proptest::collection::vec(0u8..=255, 0..64)) {
            // Arbitrary bytes must decode or fail cleanly, never panic.
            let _ = Packet::decode(&raw);
        }
    }
}
