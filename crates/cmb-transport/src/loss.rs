//! # TFRC Receiver — Loss-Event History and Feedback
//!
//! Receiver half of the rate-control loop (RFC 5348 §5 and §6): detect
//! sequence gaps behind a small reordering window, interpolate arrival times
//! for the missing packets, aggregate losses within one RTT into loss
//! events, and reduce the recent loss intervals to the loss event rate `p`
//! reported in Feedback packets.

use std::time::Duration;

use crate::seqnum::SequenceNumber;
use crate::timestamp::Timestamp;
use crate::tfrc::invert_tcp_throughput;
use crate::wire::Feedback;

/// Reordering tolerance: a packet is declared lost once NDUPACK packets with
/// higher sequence numbers have arrived (RFC 5348 §5.1).
pub const NDUPACK: usize = 3;

/// Number of loss intervals kept for the weighted average (RFC 5348 §5.4).
pub const LOSS_INTERVAL_HISTORY: usize = 8;

/// Loss interval weights, newest first (RFC 5348 §5.4).
const WEIGHTS: [f64; LOSS_INTERVAL_HISTORY] = [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];

// ─── Loss History ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Received {
    seq: SequenceNumber,
    at: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct LossEvent {
    /// First lost sequence number of the event.
    seq: SequenceNumber,
    /// Interpolated loss time of that packet.
    at: Timestamp,
}

/// Gap detection and loss-interval bookkeeping.
pub struct LossHistory {
    /// Sorted window of the most recent NDUPACK+1 received sequences.
    recent: Vec<Received>,
    /// Loss events, newest first.
    events: Vec<LossEvent>,
    /// Synthetic length of the interval preceding the oldest event
    /// (RFC 5348 §6.3.1), set after the first loss event.
    initial_interval: Option<f64>,
}

impl LossHistory {
    pub fn new() -> Self {
        LossHistory {
            recent: Vec::with_capacity(NDUPACK + 2),
            events: Vec::new(),
            initial_interval: None,
        }
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Set the synthetic first loss interval (once, after the first event).
    pub fn set_initial_interval(&mut self, length: f64) {
        if self.initial_interval.is_none() {
            self.initial_interval = Some(length.max(1.0));
        }
    }

    /// Record one received sequence number. Returns the number of new loss
    /// events the arrival revealed.
    pub fn record(&mut self, seq: SequenceNumber, at: Timestamp, rtt: Duration) -> usize {
        if self.recent.iter().any(|r| r.seq == seq) {
            return 0; // duplicate
        }
        let position = self
            .recent
            .iter()
            .position(|r| seq < r.seq)
            .unwrap_or(self.recent.len());
        self.recent.insert(position, Received { seq, at });

        let mut new_events = 0;
        while self.recent.len() > NDUPACK + 1 {
            let oldest = self.recent.remove(0);
            let next = self.recent[0];
            new_events += self.account_gap(oldest, next, rtt);
        }
        new_events
    }

    /// Declare every sequence strictly between `before` and `after` lost,
    /// with interpolated loss times (RFC 5348 §5.2).
    fn account_gap(&mut self, before: Received, after: Received, rtt: Duration) -> usize {
        let gap = after.seq.distance_from(before.seq);
        if gap <= 1 {
            return 0;
        }
        let span = after.at.duration_since(before.at);
        let mut new_events = 0;
        for step in 1..gap {
            let lost_seq = before.seq.add(step);
            let offset = span.mul_f64(step as f64 / gap as f64);
            let lost_at = before.at + offset;

            let starts_new_event = match self.events.first() {
                None => true,
                Some(newest) => lost_at.is_after(newest.at + rtt),
            };
            if starts_new_event {
                self.events.insert(
                    0,
                    LossEvent {
                        seq: lost_seq,
                        at: lost_at,
                    },
                );
                self.events.truncate(LOSS_INTERVAL_HISTORY);
                new_events += 1;
            }
        }
        new_events
    }

    /// Loss interval lengths in packets, newest (open) first.
    fn intervals(&self, newest_seq: SequenceNumber) -> Vec<f64> {
        let mut intervals = Vec::with_capacity(self.events.len() + 1);
        for (index, event) in self.events.iter().enumerate() {
            let length = match index.checked_sub(1) {
                // Open interval: from the newest event up to the newest
                // received sequence.
                None => newest_seq.distance_from(event.seq) + 1,
                Some(newer) => self.events[newer].seq.distance_from(event.seq),
            };
            intervals.push(length as f64);
        }
        if let Some(initial) = self.initial_interval {
            intervals.push(initial);
        }
        intervals
    }

    /// Weighted average loss interval and resulting loss event rate `p`
    /// (RFC 5348 §5.4). Zero while no loss event has occurred.
    pub fn loss_event_rate(&self, newest_seq: SequenceNumber) -> f64 {
        let intervals = self.intervals(newest_seq);
        if intervals.is_empty() {
            return 0.0;
        }
        let n = intervals.len().min(LOSS_INTERVAL_HISTORY);

        let mut weighted_including_open = 0.0;
        let mut weight_total = 0.0;
        for i in 0..n {
            weighted_including_open += intervals[i] * WEIGHTS[i];
            weight_total += WEIGHTS[i];
        }
        let mut weighted_excluding_open = 0.0;
        for i in 1..intervals.len().min(LOSS_INTERVAL_HISTORY + 1) {
            weighted_excluding_open += intervals[i] * WEIGHTS[i - 1];
        }

        let mean = weighted_including_open.max(weighted_excluding_open) / weight_total;
        if mean <= 0.0 {
            0.0
        } else {
            (1.0 / mean).min(1.0)
        }
    }
}

impl Default for LossHistory {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// What the runtime should do after handing one Data arrival to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// First-ever data: send feedback immediately and start the timer.
    SendInitialFeedback,
    /// The sender cannot have an RTT estimate yet: restart the feedback
    /// timer at the given interval and send an intermediate feedback.
    RestartTimer(Duration),
    /// Loss event rate increased: fire the feedback timer early.
    ExpediteFeedback,
    /// Nothing to do until the feedback timer fires.
    Continue,
}

/// TFRC receiver: per-interval accounting plus loss history, producing the
/// fields of a Feedback packet on demand.
pub struct TfrcReceiver {
    segment_size: f64,
    history: LossHistory,
    newest_seq: Option<SequenceNumber>,
    packet_count: u64,
    interval_start: Timestamp,
    max_receive_rate: f64,
    last_reported_loss_rate: f64,
    feedbacks_sent: u64,
}

impl TfrcReceiver {
    pub fn new(segment_size: usize, now: Timestamp) -> Self {
        TfrcReceiver {
            segment_size: segment_size as f64,
            history: LossHistory::new(),
            newest_seq: None,
            packet_count: 0,
            interval_start: now,
            max_receive_rate: 0.0,
            last_reported_loss_rate: 0.0,
            feedbacks_sent: 0,
        }
    }

    pub fn loss_event_rate(&self) -> f64 {
        match self.newest_seq {
            Some(newest) => self.history.loss_event_rate(newest),
            None => 0.0,
        }
    }

    /// Account one Data arrival (RFC 5348 §6.1).
    pub fn on_data(
        &mut self,
        seq: SequenceNumber,
        now: Timestamp,
        rtt: Option<Duration>,
    ) -> DataOutcome {
        self.packet_count += 1;

        let first_ever = self.newest_seq.is_none();
        if self
            .newest_seq
            .is_none_or(|newest| newest < seq)
        {
            self.newest_seq = Some(seq);
        }

        let before = self.loss_event_rate();
        self.history
            .record(seq, now, rtt.unwrap_or(Duration::from_millis(1)));
        let after = self.loss_event_rate();

        if first_ever {
            return DataOutcome::SendInitialFeedback;
        }
        // Until the second feedback is out, the sender is still measuring its
        // first RTT; keep the timer aligned with the current estimate.
        if self.feedbacks_sent < 2 {
            if let Some(rtt) = rtt {
                return DataOutcome::RestartTimer(rtt);
            }
        }
        if after > before || after > self.last_reported_loss_rate {
            return DataOutcome::ExpediteFeedback;
        }
        DataOutcome::Continue
    }

    /// Produce the Feedback fields for the current interval and reset the
    /// interval counters (RFC 5348 §6.2).
    pub fn build_feedback(
        &mut self,
        echoed_timestamp: Timestamp,
        delay: Duration,
        rtt: Option<Duration>,
        now: Timestamp,
    ) -> Feedback {
        let interval = now
            .duration_since(self.interval_start)
            .max(Duration::from_millis(1));
        let receive_rate = self.packet_count as f64 * self.segment_size / interval.as_secs_f64();
        self.max_receive_rate = self.max_receive_rate.max(receive_rate);

        // First loss event: seed the synthetic first interval by inverting
        // the throughput equation against the peak receive rate (§6.3.1).
        if self.history.has_events() {
            if let Some(rtt) = rtt {
                let p = invert_tcp_throughput(
                    self.segment_size,
                    rtt.as_secs_f64().max(1.0e-6),
                    self.max_receive_rate.max(self.segment_size),
                );
                self.history.set_initial_interval(1.0 / p);
            }
        }

        let loss_event_rate = self.loss_event_rate();
        self.last_reported_loss_rate = loss_event_rate;
        self.packet_count = 0;
        self.interval_start = now;
        self.feedbacks_sent += 1;

        Feedback {
            delay: delay.as_millis().min(u16::MAX as u128) as u16,
            timestamp: echoed_timestamp,
            receive_rate: receive_rate.min(u32::MAX as f64) as u32,
            loss_event_rate: loss_event_rate as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn seq(v: u32) -> SequenceNumber {
        SequenceNumber::new(v)
    }

    const RTT: Duration = Duration::from_millis(100);

    // ─── Loss History ───────────────────────────────────────────────────

    #[test]
    fn in_order_arrivals_report_no_loss() {
        let mut history = LossHistory::new();
        for i in 0..50 {
            assert_eq!(history.record(seq(i), ts(i as u64 * 10), RTT), 0);
        }
        assert!(!history.has_events());
        assert_eq!(history.loss_event_rate(seq(49)), 0.0);
    }

    #[test]
    fn reordering_within_window_is_not_loss() {
        let mut history = LossHistory::new();
        for &i in &[0u32, 1, 3, 2, 4, 5] {
            history.record(seq(i), ts(i as u64 * 10), RTT);
        }
        assert!(!history.has_events());
    }

    #[test]
    fn gap_behind_window_becomes_loss_event() {
        let mut history = LossHistory::new();
        // 2 never arrives; once 3..6 are in, 2 leaves the window as a gap.
        for &i in &[0u32, 1, 3, 4, 5, 6] {
            history.record(seq(i), ts(i as u64 * 10), RTT);
        }
        assert_eq!(history.event_count(), 1);
        assert!(history.loss_event_rate(seq(6)) > 0.0);
    }

    #[test]
    fn burst_within_rtt_is_one_event() {
        let mut history = LossHistory::new();
        // Sequences 2, 3, 4 all lost within the same RTT: one event.
        history.record(seq(0), ts(0), RTT);
        history.record(seq(1), ts(10), RTT);
        for &i in &[5u32, 6, 7, 8] {
            history.record(seq(i), ts(20 + i as u64), RTT);
        }
        assert_eq!(history.event_count(), 1);
    }

    #[test]
    fn losses_apart_by_more_than_rtt_are_separate_events() {
        let mut history = LossHistory::new();
        history.record(seq(0), ts(0), RTT);
        // Gap at 1, detected with neighbors 2..4 close to t=0.
        for &i in &[2u32, 3, 4, 5] {
            history.record(seq(i), ts(10 + i as u64), RTT);
        }
        assert_eq!(history.event_count(), 1);
        // Much later, gap at 6.
        for &i in &[7u32, 8, 9, 10] {
            history.record(seq(i), ts(1_000 + i as u64), RTT);
        }
        assert_eq!(history.event_count(), 2);
    }

    #[test]
    fn duplicate_sequences_are_ignored() {
        let mut history = LossHistory::new();
        history.record(seq(0), ts(0), RTT);
        history.record(seq(0), ts(5), RTT);
        history.record(seq(1), ts(10), RTT);
        assert!(!history.has_events());
    }

    #[test]
    fn higher_loss_density_means_higher_rate() {
        let mut sparse = LossHistory::new();
        let mut time = 0u64;
        let mut s = 0u32;
        // One loss per 100 packets.
        for _ in 0..3 {
            for _ in 0..99 {
                sparse.record(seq(s), ts(time), RTT);
                s += 1;
                time += 2_000;
            }
            s += 1; // drop one
        }
        let sparse_rate = sparse.loss_event_rate(seq(s - 1));

        let mut dense = LossHistory::new();
        let mut time = 0u64;
        let mut s = 0u32;
        // One loss per 10 packets.
        for _ in 0..3 {
            for _ in 0..9 {
                dense.record(seq(s), ts(time), RTT);
                s += 1;
                time += 2_000;
            }
            s += 1;
        }
        let dense_rate = dense.loss_event_rate(seq(s - 1));

        assert!(sparse_rate > 0.0);
        assert!(
            dense_rate > sparse_rate,
            "dense {dense_rate} vs sparse {sparse_rate}"
        );
    }

    #[test]
    fn event_list_is_bounded() {
        let mut history = LossHistory::new();
        let mut s = 0u32;
        let mut time = 0u64;
        for _ in 0..20 {
            for _ in 0..5 {
                history.record(seq(s), ts(time), RTT);
                s += 1;
                time += 500; // 500ms apart, every loss is its own event
            }
            s += 1;
        }
        assert!(history.event_count() <= LOSS_INTERVAL_HISTORY);
    }

    #[test]
    fn initial_interval_extends_history() {
        let mut history = LossHistory::new();
        history.record(seq(0), ts(0), RTT);
        for &i in &[2u32, 3, 4, 5] {
            history.record(seq(i), ts(10 + i as u64), RTT);
        }
        let bare = history.loss_event_rate(seq(5));
        history.set_initial_interval(1_000.0);
        let seeded = history.loss_event_rate(seq(5));
        assert!(
            seeded < bare,
            "a long synthetic first interval must lower p: {bare} -> {seeded}"
        );
    }

    // ─── Receiver ───────────────────────────────────────────────────────

    #[test]
    fn first_data_triggers_initial_feedback() {
        let mut receiver = TfrcReceiver::new(512, ts(0));
        let outcome = receiver.on_data(seq(0), ts(10), None);
        assert_eq!(outcome, DataOutcome::SendInitialFeedback);
    }

    #[test]
    fn early_arrivals_restart_timer_while_sender_lacks_rtt() {
        let mut receiver = TfrcReceiver::new(512, ts(0));
        receiver.on_data(seq(0), ts(10), Some(RTT));
        let outcome = receiver.on_data(seq(1), ts(20), Some(RTT));
        assert_eq!(outcome, DataOutcome::RestartTimer(RTT));
    }

    #[test]
    fn new_loss_expedites_feedback() {
        let mut receiver = TfrcReceiver::new(512, ts(0));
        let mut now = 0u64;
        receiver.on_data(seq(0), ts(now), Some(RTT));
        receiver.build_feedback(ts(0), Duration::ZERO, Some(RTT), ts(5));
        receiver.build_feedback(ts(0), Duration::ZERO, Some(RTT), ts(6));

        for &i in &[1u32, 3, 4, 5, 6] {
            now += 10;
            let outcome = receiver.on_data(seq(i), ts(now), Some(RTT));
            if i == 6 {
                // By now sequence 2 has fallen out of the reorder window.
                assert_eq!(outcome, DataOutcome::ExpediteFeedback);
            }
        }
    }

    #[test]
    fn feedback_reports_receive_rate() {
        let mut receiver = TfrcReceiver::new(512, ts(0));
        receiver.on_data(seq(0), ts(0), Some(RTT));
        receiver.build_feedback(ts(0), Duration::ZERO, Some(RTT), ts(0));
        receiver.build_feedback(ts(0), Duration::ZERO, Some(RTT), ts(0));

        // 10 packets over 100ms = 51200 B/s.
        for i in 1..=10u32 {
            receiver.on_data(seq(i), ts(i as u64 * 10), Some(RTT));
        }
        let feedback = receiver.build_feedback(ts(80), Duration::from_millis(3), Some(RTT), ts(100));
        assert_eq!(feedback.receive_rate, 51_200);
        assert_eq!(feedback.delay, 3);
        assert_eq!(feedback.timestamp, ts(80));
        assert_eq!(feedback.loss_event_rate, 0.0);
    }

    #[test]
    fn feedback_seeds_initial_interval_on_first_loss() {
        let mut receiver = TfrcReceiver::new(512, ts(0));
        receiver.on_data(seq(0), ts(0), Some(RTT));
        for &i in &[2u32, 3, 4, 5] {
            receiver.on_data(seq(i), ts(10 + i as u64), Some(RTT));
        }
        assert!(receiver.history.has_events());
        let feedback = receiver.build_feedback(ts(10), Duration::ZERO, Some(RTT), ts(50));
        assert!(feedback.loss_event_rate > 0.0);
        assert!(receiver.history.initial_interval.is_some());
    }
}
