//! # Provider Per-Flow State Machine
//!
//! Pure logic — no I/O. One `ProviderFlow` tracks a single fetcher endpoint:
//! connection state, the directed block range still owed, acknowledged
//! blocks, the NACK repair queue, and the combined symbol generator the
//! pacing loop drains. The runtime owns the socket and the clock; every
//! transition here is driven by decoded packets and explicit timestamps.
//!
//! ## Combined generator
//!
//! `next_symbol` serves three phases in strict priority order:
//!
//! 1. **Repair priority** — drain the NACK queue, yielding up to the
//!    requested burst of fresh repair symbols per stalled block.
//! 2. **Source phase** — walk the directed range and yield each unacked
//!    block's source symbols one at a time, re-checking acknowledgement and
//!    range between symbols.
//! 3. **Preemptive repair** — once source symbols are exhausted, round-robin
//!    one fresh repair symbol per still-unacked block until the range is
//!    fully acknowledged.

use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use std::vec::IntoIter;

use crate::coding::Encoder;
use crate::range::BlockRange;
use crate::resource::ResourceId;
use crate::timestamp::Timestamp;
use crate::wire::{AckBlock, Data, Error, ErrorCode, NackBlock, RequestResource, ShrinkRange};

/// Connection state of a provider flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// Created for a peer, no valid request seen yet.
    New,
    /// Serving a matched request.
    Connected,
    /// Finished or aborted; the flow only awaits teardown.
    Done,
}

/// Result of processing a `RequestResource`.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Resource id mismatch: answer with this error, then tear down.
    Rejected(Error),
    /// First matching request: record the range and start the sender loop.
    Connected,
    /// Keep-alive while connected: parameters refreshed.
    Refreshed,
    /// Request seen after the flow was already done.
    Ignored,
}

/// One pending NACK: burst of repair symbols owed to a stalled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NackEntry {
    /// Heap key; smaller pops first (blocks nearest the head of line).
    key: u64,
    block_id: u64,
    repair_count: u32,
}

impl Ord for NackEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert to pop the smallest key.
        Reverse(self.key).cmp(&Reverse(other.key))
    }
}

impl PartialOrd for NackEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-flow provider state machine.
pub struct ProviderFlow {
    resource_id: ResourceId,
    /// Block encoders, shared between all flows serving the same resource.
    encoders: Arc<BTreeMap<u64, Encoder>>,
    state: ProviderState,
    range: BlockRange,
    sending_rate: u32,
    /// Timestamp carried by the most recent keep-alive, echoed into Data.
    receiver_timestamp: Timestamp,
    /// When that keep-alive arrived, for the Data delay field.
    keepalive_at: Timestamp,
    acknowledged: HashSet<u64>,
    /// Next fresh repair symbol index per block.
    repair_offsets: HashMap<u64, u32>,
    nack_queue: BinaryHeap<NackEntry>,
    /// Blocks currently queued for NACK repair, to drop duplicate NACKs.
    nack_pending: HashSet<u64>,
    /// Remaining burst of the NACK entry being served.
    current_nack: Option<(u64, u32)>,
    /// Source-phase cursor and the symbols of the block being walked.
    source_cursor: u64,
    current_source: Option<(u64, IntoIter<Bytes>)>,
    /// Preemptive-repair round-robin cursor.
    preemptive_cursor: u64,
}

impl ProviderFlow {
    pub fn new(resource_id: ResourceId, encoders: Arc<BTreeMap<u64, Encoder>>) -> Self {
        ProviderFlow {
            resource_id,
            encoders,
            state: ProviderState::New,
            range: BlockRange::new(0, 0),
            sending_rate: 0,
            receiver_timestamp: Timestamp::from_millis(0),
            keepalive_at: Timestamp::from_millis(0),
            acknowledged: HashSet::new(),
            repair_offsets: HashMap::new(),
            nack_queue: BinaryHeap::new(),
            nack_pending: HashSet::new(),
            current_nack: None,
            source_cursor: 0,
            current_source: None,
            preemptive_cursor: 0,
        }
    }

    pub fn state(&self) -> ProviderState {
        self.state
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    pub fn sending_rate(&self) -> u32 {
        self.sending_rate
    }

    /// Time since the last keep-alive, for the 4 × MAX_HEARTBEAT timeout.
    pub fn keepalive_elapsed(&self, now: Timestamp) -> Duration {
        now.duration_since(self.keepalive_at)
    }

    /// The flow has nothing left to send: range collapsed or fully acked.
    pub fn is_complete(&self) -> bool {
        match self.state {
            ProviderState::New => false,
            ProviderState::Done => true,
            ProviderState::Connected => self.remaining_unacked() == 0,
        }
    }

    fn remaining_unacked(&self) -> u64 {
        self.range
            .iter()
            .filter(|id| self.encoders.contains_key(id) && !self.acknowledged.contains(id))
            .count() as u64
    }

    // ─── Packet Handling ────────────────────────────────────────────────

    /// Process a `RequestResource` (connection attempt or keep-alive).
    pub fn handle_request(&mut self, request: &RequestResource, now: Timestamp) -> RequestOutcome {
        if self.state == ProviderState::Done {
            return RequestOutcome::Ignored;
        }
        if request.resource_id != self.resource_id {
            tracing::debug!(
                requested = %request.resource_id,
                served = %self.resource_id,
                "resource id mismatch"
            );
            self.state = ProviderState::Done;
            return RequestOutcome::Rejected(Error {
                code: ErrorCode::ResourceNotFound,
            });
        }

        self.keepalive_at = now;
        self.receiver_timestamp = request.timestamp;
        self.sending_rate = request.sending_rate;

        match self.state {
            ProviderState::New => {
                self.state = ProviderState::Connected;
                self.range = BlockRange::new(request.range_start, request.range_end);
                self.source_cursor = self.range.start();
                self.preemptive_cursor = self.range.start();
                tracing::debug!(range = %self.range, rate = self.sending_rate, "flow connected");
                RequestOutcome::Connected
            }
            ProviderState::Connected => {
                self.shrink_range(request.range_start, request.range_end);
                RequestOutcome::Refreshed
            }
            ProviderState::Done => RequestOutcome::Ignored,
        }
    }

    /// Record a decoded block. Duplicate ACKs are harmless.
    pub fn handle_ack(&mut self, ack: &AckBlock) {
        if self.acknowledged.insert(ack.block_id) {
            tracing::trace!(block_id = ack.block_id, "block acknowledged");
        }
    }

    /// Queue a repair burst for a stalled block, unless one is pending.
    pub fn handle_nack(&mut self, nack: &NackBlock) {
        let block_id = nack.block_id;
        if self.nack_pending.contains(&block_id)
            || self.acknowledged.contains(&block_id)
            || !self.range.contains(block_id)
        {
            return;
        }
        let minimum = match self.encoders.get(&block_id) {
            Some(encoder) => encoder.minimum_symbols(),
            None => return,
        };
        let repair_count = minimum.saturating_sub(nack.packets_received as u32).max(2);
        self.nack_pending.insert(block_id);
        self.nack_queue.push(NackEntry {
            key: self.nack_heap_key(block_id),
            block_id,
            repair_count,
        });
        tracing::trace!(block_id, repair_count, "nack queued");
    }

    /// Heap key placing blocks nearest the head of line first.
    fn nack_heap_key(&self, block_id: u64) -> u64 {
        if self.range.is_reverse() {
            u64::MAX - block_id
        } else {
            block_id
        }
    }

    pub fn handle_shrink(&mut self, shrink: &ShrinkRange) {
        self.shrink_range(shrink.range_start, shrink.range_end);
    }

    /// Tighten the flow's range monotonically (§ convergence). The start may
    /// only move toward the end (fetcher's own progress) and the end only
    /// toward the start (opposite flow's progress); anything else is a
    /// confused peer and is ignored.
    pub fn shrink_range(&mut self, new_start: u64, new_end: u64) {
        if self.range.is_empty() {
            return;
        }
        if new_start == new_end {
            self.range = BlockRange::new(new_start, new_start);
            return;
        }
        let update = BlockRange::new(new_start, new_end);
        if update.is_reverse() != self.range.is_reverse() {
            tracing::debug!(current = %self.range, update = %update, "opposing shrink ignored");
            return;
        }
        self.range.tighten_start(new_start);
        self.range.tighten_end(new_end);
    }

    // ─── Combined Generator ─────────────────────────────────────────────

    /// Pop the next `(block_id, symbol)` to send, or `None` once every block
    /// in the range has been acknowledged or the range collapsed.
    pub fn next_symbol(&mut self) -> Option<(u64, Bytes)> {
        if self.state != ProviderState::Connected {
            return None;
        }
        loop {
            if self.remaining_unacked() == 0 {
                return None;
            }
            if let Some(symbol) = self.next_nack_repair() {
                return Some(symbol);
            }
            if let Some(symbol) = self.next_source_symbol() {
                return Some(symbol);
            }
            if let Some(symbol) = self.next_preemptive_repair() {
                return Some(symbol);
            }
        }
    }

    /// Whether the block still needs symbols at all.
    fn needs_symbols(&self, block_id: u64) -> bool {
        self.range.contains(block_id)
            && !self.acknowledged.contains(&block_id)
            && self.encoders.contains_key(&block_id)
    }

    fn fresh_repair(&mut self, block_id: u64) -> Bytes {
        let offset = self.repair_offsets.entry(block_id).or_insert(0);
        let symbol = self.encoders[&block_id].repair_symbol(*offset);
        *offset += 1;
        symbol
    }

    /// Phase 1: serve queued NACK bursts, nearest head-of-line block first.
    fn next_nack_repair(&mut self) -> Option<(u64, Bytes)> {
        loop {
            let (block_id, remaining) = match self.current_nack.take() {
                Some(burst) => burst,
                None => {
                    let entry = self.nack_queue.pop()?;
                    self.nack_pending.remove(&entry.block_id);
                    (entry.block_id, entry.repair_count)
                }
            };
            if remaining == 0 || !self.needs_symbols(block_id) {
                continue;
            }
            self.current_nack = Some((block_id, remaining - 1));
            let symbol = self.fresh_repair(block_id);
            return Some((block_id, symbol));
        }
    }

    /// Phase 2: walk the directed range, one source symbol per call.
    fn next_source_symbol(&mut self) -> Option<(u64, Bytes)> {
        loop {
            if let Some((block_id, mut symbols)) = self.current_source.take() {
                if self.needs_symbols(block_id) {
                    if let Some(symbol) = symbols.next() {
                        self.current_source = Some((block_id, symbols));
                        return Some((block_id, symbol));
                    }
                }
                // Exhausted, acknowledged mid-block, or shrunk away.
            }
            // A shrink may have moved the range start past the cursor.
            let behind_start = if self.range.is_reverse() {
                self.source_cursor > self.range.start()
            } else {
                self.source_cursor < self.range.start()
            };
            if behind_start {
                self.source_cursor = self.range.start();
            }
            // Find the next unacked block at or past the cursor.
            while self.range.contains(self.source_cursor) && !self.needs_symbols(self.source_cursor)
            {
                self.source_cursor = self.range.step(self.source_cursor);
            }
            if !self.range.contains(self.source_cursor) {
                return None;
            }
            let block_id = self.source_cursor;
            self.source_cursor = self.range.step(self.source_cursor);
            let symbols: Vec<Bytes> = self.encoders[&block_id].source_symbols().collect();
            self.current_source = Some((block_id, symbols.into_iter()));
        }
    }

    /// Phase 3: round-robin one fresh repair symbol per unacked block.
    fn next_preemptive_repair(&mut self) -> Option<(u64, Bytes)> {
        let span = self.range.len();
        if !self.range.contains(self.preemptive_cursor) {
            self.preemptive_cursor = self.range.start();
        }
        for _ in 0..span {
            let block_id = self.preemptive_cursor;
            self.preemptive_cursor = if self.range.contains(self.range.step(block_id)) {
                self.range.step(block_id)
            } else {
                self.range.start()
            };
            if self.needs_symbols(block_id) {
                let symbol = self.fresh_repair(block_id);
                return Some((block_id, symbol));
            }
        }
        None
    }

    /// Wrap a symbol into a Data packet with the echoed receiver timestamp
    /// and the elapsed hold since the last keep-alive.
    pub fn data_packet(&self, block_id: u64, symbol: Bytes, now: Timestamp) -> Data {
        let delay = now.duration_since(self.keepalive_at).as_millis();
        Data {
            block_id,
            receiver_timestamp: self.receiver_timestamp,
            delay: delay.min(u16::MAX as u128) as u16,
            symbol,
        }
    }
}
