//! # Fetcher Per-Flow State Machine
//!
//! Pure logic — no I/O. One `FetcherFlow` owns a single direction of a
//! fetch: it feeds arriving FEC symbols into per-block decoders, smooths the
//! RTT estimate, produces ACK/NACK/ShrinkRange traffic as drainable actions,
//! tracks head-of-line progress from its own end, and shrinks its tail as
//! the coordinator reports blocks delivered by the opposite flow.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::coding::{Decoder, CODEC_HEADER_SIZE};
use crate::range::BlockRange;
use crate::resource::ResourceId;
use crate::timestamp::Timestamp;
use crate::wire::{AckBlock, Data, ErrorCode, NackBlock, Packet, RequestResource, ShrinkRange};
use crate::{MAX_HEARTBEAT_INTERVAL, MAX_TRANSMISSION_UNIT, SCHEDULING_GRANULARITY};

/// RTT smoothing factor: `rtt ← q·rtt + (1−q)·sample`.
const RTT_SMOOTHING: f64 = 0.9;

/// Symbols received before a block may be NACKed regardless of distance.
const NACK_MIN_SYMBOLS: u16 = 3;

/// Block distance at which an in-flight block may be NACKed.
const NACK_MIN_DISTANCE: u64 = 2;

/// Fetcher flow configuration.
#[derive(Debug, Clone, Copy)]
pub struct FetcherConfig {
    /// Requested provider pacing rate, bytes/second.
    pub sending_rate: u32,
    /// FEC symbol size; matches the provider's MTU.
    pub symbol_size: u16,
    /// Iterate block ids descending from the last block.
    pub reverse: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            sending_rate: crate::DEFAULT_SENDING_RATE,
            symbol_size: MAX_TRANSMISSION_UNIT as u16,
            reverse: false,
        }
    }
}

/// Work the runtime must carry out after handling a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum FetcherAction {
    /// Transmit this packet to the provider.
    Send(Packet),
    /// Hand a decoded block to the coordinator.
    Deliver { block_id: u64, data: Bytes },
    /// The flow's range is empty; stop the flow tasks.
    Shutdown,
    /// The provider reported a fatal error; cancel the whole fetch.
    Fatal(ErrorCode),
}

struct PendingBlock {
    decoder: Decoder,
    packets_received: u16,
}

/// Per-flow fetcher state machine.
pub struct FetcherFlow {
    resource_id: ResourceId,
    config: FetcherConfig,
    range: BlockRange,
    /// Smoothed RTT in seconds.
    rtt: Option<f64>,
    /// Decoded blocks and when they were (last) acknowledged.
    acknowledged: HashMap<u64, Timestamp>,
    pending: HashMap<u64, PendingBlock>,
    last_nack: HashMap<u64, Timestamp>,
    /// Own-direction blocks decoded ahead of the head of line.
    head_of_line_blocked: HashSet<u64>,
    /// Opposite-flow deliveries ahead of this flow's tail.
    opposite_head_of_line_blocked: HashSet<u64>,
    actions: VecDeque<FetcherAction>,
}

impl FetcherFlow {
    pub fn new(resource_id: ResourceId, config: FetcherConfig) -> Self {
        let blocks = resource_id.number_of_blocks();
        let range = if config.reverse {
            BlockRange::reverse(blocks)
        } else {
            BlockRange::forward(blocks)
        };
        FetcherFlow {
            resource_id,
            config,
            range,
            rtt: None,
            acknowledged: HashMap::new(),
            pending: HashMap::new(),
            last_nack: HashMap::new(),
            head_of_line_blocked: HashSet::new(),
            opposite_head_of_line_blocked: HashSet::new(),
            actions: VecDeque::new(),
        }
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.map(Duration::from_secs_f64)
    }

    pub fn is_finished(&self) -> bool {
        self.range.is_empty()
    }

    /// Drain the queued actions in emission order.
    pub fn drain_actions(&mut self) -> impl Iterator<Item = FetcherAction> + '_ {
        self.actions.drain(..)
    }

    // ─── Keep-Alive ─────────────────────────────────────────────────────

    /// The periodic `RequestResource` heartbeat with current parameters.
    pub fn keepalive(&self, now: Timestamp) -> RequestResource {
        RequestResource {
            timestamp: now,
            sending_rate: self.config.sending_rate,
            range_start: self.range.start(),
            resource_id: self.resource_id,
            range_end: self.range.end(),
        }
    }

    /// Heartbeat period: four segment times at the requested rate, clamped
    /// between the scheduling granularity and the heartbeat ceiling.
    pub fn keepalive_interval(&self) -> Duration {
        match self.rtt {
            None => MAX_HEARTBEAT_INTERVAL,
            Some(_) => {
                let segment = 4.0 * MAX_TRANSMISSION_UNIT as f64 / self.config.sending_rate as f64;
                Duration::from_secs_f64(segment)
                    .max(SCHEDULING_GRANULARITY)
                    .min(MAX_HEARTBEAT_INTERVAL)
            }
        }
    }

    // ─── Data Handling ──────────────────────────────────────────────────

    /// Feed one Data packet into the flow.
    pub fn handle_data(&mut self, data: &Data, now: Timestamp) {
        self.update_rtt(data, now);

        let block_id = data.block_id;
        if self.range.contains(block_id) && !self.acknowledged.contains_key(&block_id) {
            if data.symbol.len() != CODEC_HEADER_SIZE + self.config.symbol_size as usize {
                tracing::debug!(block_id, len = data.symbol.len(), "dropping odd-sized symbol");
                return;
            }
            let decoded = self.feed_symbol(block_id, data.symbol.clone());
            self.generate_nacks(block_id, now);
            if let Some(bytes) = decoded {
                self.complete_block(block_id, bytes, now);
            }
        } else if let Some(acked_at) = self.acknowledged.get(&block_id).copied() {
            // The provider keeps sending: our ACK probably got lost.
            let rtt = Duration::from_secs_f64(self.rtt.unwrap_or(0.0));
            if now.duration_since(acked_at) > 4 * rtt {
                self.acknowledged.insert(block_id, now);
                self.actions
                    .push_back(FetcherAction::Send(Packet::AckBlock(AckBlock { block_id })));
            }
        }
        // Anything else: symbol for a block outside the range, ignore.
    }

    fn update_rtt(&mut self, data: &Data, now: Timestamp) {
        let sample = now
            .duration_since(data.receiver_timestamp)
            .saturating_sub(Duration::from_millis(data.delay as u64))
            .as_secs_f64();
        self.rtt = Some(match self.rtt {
            None => sample,
            Some(rtt) => RTT_SMOOTHING * rtt + (1.0 - RTT_SMOOTHING) * sample,
        });
    }

    fn feed_symbol(&mut self, block_id: u64, symbol: Bytes) -> Option<Bytes> {
        let block_size = self.resource_id.block_size_of(block_id)?;
        let symbol_size = self.config.symbol_size;
        let entry = self.pending.entry(block_id).or_insert_with(|| PendingBlock {
            decoder: Decoder::new(block_size, symbol_size),
            packets_received: 0,
        });
        entry.packets_received = entry.packets_received.saturating_add(1);
        entry.decoder.decode([symbol])
    }

    /// NACK every stalled block strictly before `arrived` in flow order.
    fn generate_nacks(&mut self, arrived: u64, now: Timestamp) {
        let window = self.nack_window();
        let stalled: Vec<u64> = self
            .range
            .up_to(arrived)
            .iter()
            .filter(|id| !self.acknowledged.contains_key(id))
            .collect();
        for block_id in stalled {
            let packets_received = self
                .pending
                .get(&block_id)
                .map(|p| p.packets_received)
                .unwrap_or(0);
            let far_enough = arrived.abs_diff(block_id) >= NACK_MIN_DISTANCE;
            if !far_enough && packets_received < NACK_MIN_SYMBOLS {
                continue;
            }
            if let Some(last) = self.last_nack.get(&block_id) {
                if now.duration_since(*last) < window {
                    continue;
                }
            }
            self.last_nack.insert(block_id, now);
            self.actions
                .push_back(FetcherAction::Send(Packet::NackBlock(NackBlock {
                    block_id,
                    packets_received,
                })));
        }
    }

    /// The re-NACK suppression window: `4·rtt + MSS/rate`.
    fn nack_window(&self) -> Duration {
        let rtt = self.rtt.unwrap_or(0.0);
        let segment = MAX_TRANSMISSION_UNIT as f64 / self.config.sending_rate as f64;
        Duration::from_secs_f64(4.0 * rtt + segment)
    }

    fn complete_block(&mut self, block_id: u64, bytes: Bytes, now: Timestamp) {
        self.pending.remove(&block_id);
        self.last_nack.remove(&block_id);
        self.acknowledged.insert(block_id, now);
        self.actions
            .push_back(FetcherAction::Send(Packet::AckBlock(AckBlock { block_id })));
        self.actions.push_back(FetcherAction::Deliver {
            block_id,
            data: bytes,
        });

        // Head-of-line advancement.
        if block_id == self.range.start() {
            self.range.advance_start();
            while !self.range.is_empty() && self.head_of_line_blocked.remove(&self.range.start()) {
                self.range.advance_start();
            }
            if self.range.is_empty() {
                self.actions.push_back(FetcherAction::Shutdown);
            }
        } else {
            self.head_of_line_blocked.insert(block_id);
        }
    }

    // ─── Opposite-Flow Convergence ──────────────────────────────────────

    /// The block id just inside this flow's exclusive tail.
    fn inside_end(&self) -> u64 {
        if self.range.is_reverse() {
            self.range.end() + 1
        } else {
            self.range.end() - 1
        }
    }

    /// The coordinator reports a block delivered by the opposing flow:
    /// shrink this flow's tail toward the meeting point and tell the
    /// provider.
    pub fn on_opposite_block(&mut self, block_id: u64) {
        if self.range.is_empty() || !self.range.contains(block_id) {
            return;
        }
        self.opposite_head_of_line_blocked.insert(block_id);

        let mut moved = false;
        while !self.range.is_empty()
            && self.opposite_head_of_line_blocked.remove(&self.inside_end())
        {
            self.range.retreat_end();
            moved = true;
        }
        if !moved {
            return;
        }
        self.drop_out_of_range_state();
        self.actions
            .push_back(FetcherAction::Send(Packet::ShrinkRange(ShrinkRange {
                range_start: self.range.start(),
                range_end: self.range.end(),
            })));
        if self.range.is_empty() {
            self.actions.push_back(FetcherAction::Shutdown);
        }
    }

    fn drop_out_of_range_state(&mut self) {
        let range = self.range;
        self.pending.retain(|id, _| range.contains(*id));
        self.last_nack.retain(|id, _| range.contains(*id));
        self.head_of_line_blocked.retain(|id| range.contains(*id));
    }

    // ─── Errors ─────────────────────────────────────────────────────────

    pub fn handle_error(&mut self, error: &crate::wire::Error) {
        match error.code {
            ErrorCode::ResourceNotFound => {
                self.actions
                    .push_back(FetcherAction::Fatal(ErrorCode::ResourceNotFound));
            }
        }
    }
}
