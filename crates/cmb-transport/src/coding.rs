//! # FEC Block Codec
//!
//! RaptorQ source-block coding behind the narrow contract the flow state
//! machines rely on: an encoder emits the block's source symbols once and an
//! unbounded, deterministically ordered stream of repair symbols; a stateful
//! decoder accepts any sufficient subset and yields the block bytes.
//!
//! Each serialized symbol carries the 4-byte RaptorQ payload id in front of
//! the symbol data, so symbols are self-identifying and a Data packet needs
//! no own source/repair marker.

use bytes::Bytes;
use raptorq::{EncodingPacket, ObjectTransmissionInformation, SourceBlockDecoder, SourceBlockEncoder};

/// Serialized size of the RaptorQ payload id preceding each symbol.
pub const CODEC_HEADER_SIZE: usize = 4;

/// All symbols of one resource live in source block 0; blocks are separated
/// by the surrounding protocol, not by the codec.
const SOURCE_BLOCK_ID: u8 = 0;

fn padded_length(data_length: usize, symbol_size: u16) -> usize {
    let symbol_size = symbol_size as usize;
    data_length.div_ceil(symbol_size) * symbol_size
}

// ─── Encoder ────────────────────────────────────────────────────────────────

/// Per-block symbol generator.
pub struct Encoder {
    inner: SourceBlockEncoder,
    minimum_symbols: u32,
}

impl Encoder {
    /// Build an encoder over one block's bytes. Input shorter than a symbol
    /// multiple is zero-padded; the decoder strips the padding again.
    pub fn new(block: &[u8], symbol_size: u16) -> Self {
        let minimum_symbols = block.len().div_ceil(symbol_size as usize) as u32;
        let mut padded = block.to_vec();
        padded.resize(padded_length(block.len(), symbol_size), 0);
        let config = ObjectTransmissionInformation::with_defaults(padded.len() as u64, symbol_size);
        Encoder {
            inner: SourceBlockEncoder::new(SOURCE_BLOCK_ID, &config, &padded),
            minimum_symbols,
        }
    }

    /// Number of symbols a decoder needs to reconstruct the block.
    pub fn minimum_symbols(&self) -> u32 {
        self.minimum_symbols
    }

    /// The block's source symbols, emitted exactly once per call.
    pub fn source_symbols(&self) -> impl Iterator<Item = Bytes> {
        self.inner
            .source_packets()
            .into_iter()
            .map(|packet| Bytes::from(packet.serialize()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// The repair symbol at `index` in the deterministic repair order.
    pub fn repair_symbol(&self, index: u32) -> Bytes {
        let packet = self
            .inner
            .repair_packets(index, 1)
            .into_iter()
            .next()
            .expect("raptorq yields a repair packet for every index");
        Bytes::from(packet.serialize())
    }

    /// Unbounded lazy stream of repair symbols starting at offset 0.
    pub fn repair_symbols(&self) -> impl Iterator<Item = Bytes> + '_ {
        (0u32..).map(|index| self.repair_symbol(index))
    }
}

// ─── Decoder ────────────────────────────────────────────────────────────────

/// Stateful per-block decoder; symbols accumulate across `decode` calls.
pub struct Decoder {
    inner: SourceBlockDecoder,
    data_length: usize,
    minimum_symbols: u32,
}

impl Decoder {
    pub fn new(block_size: usize, symbol_size: u16) -> Self {
        let padded = padded_length(block_size, symbol_size);
        let config = ObjectTransmissionInformation::with_defaults(padded as u64, symbol_size);
        Decoder {
            inner: SourceBlockDecoder::new(SOURCE_BLOCK_ID, &config, padded as u64),
            data_length: block_size,
            minimum_symbols: block_size.div_ceil(symbol_size as usize) as u32,
        }
    }

    /// Number of symbols needed to reconstruct the block.
    pub fn minimum_symbols(&self) -> u32 {
        self.minimum_symbols
    }

    /// Feed serialized symbols; returns the block bytes once enough have
    /// accumulated, with the encoder's padding stripped.
    pub fn decode<I>(&mut self, symbols: I) -> Option<Bytes>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let packets: Vec<EncodingPacket> = symbols
            .into_iter()
            .map(|symbol| EncodingPacket::deserialize(&symbol))
            .collect();
        let mut decoded = self.inner.decode(packets)?;
        decoded.truncate(self.data_length);
        Some(Bytes::from(decoded))
    }
}
