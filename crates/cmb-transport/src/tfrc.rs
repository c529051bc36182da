//! # TFRC Sender
//!
//! TCP-Friendly Rate Control per RFC 5348: the equation-based rate governor
//! that turns receiver feedback into an allowed sending rate and paced send
//! credits. Pure logic — the caller owns the clock and passes `Timestamp`s
//! in, which keeps every rate transition unit-testable.
//!
//! The governed variables (RFC 5348 §4.2):
//!
//! - `X`    — allowed sending rate, bytes/second
//! - `R`    — smoothed round-trip time estimate
//! - `RTO`  — `max(4R, 2s/X)`
//! - `p`    — loss event rate reported by the receiver
//! - `X_Bps`— the TCP throughput equation evaluated at (R, RTO, p)

use std::time::Duration;

use crate::seqnum::SequenceNumber;
use crate::timestamp::Timestamp;
use crate::SCHEDULING_GRANULARITY;

/// Maximum backoff interval t_mbi, in seconds (RFC 5348 §4.3).
pub const MAXIMUM_BACKOFF_INTERVAL: f64 = 64.0;

/// The TCP throughput equation (RFC 5348 §3.1):
/// `X = s / (R·sqrt(2p/3) + RTO·(3·sqrt(3p/8)·p·(1 + 32p²)))`.
pub fn tcp_throughput(segment_size: f64, rtt: f64, rto: f64, p: f64) -> f64 {
    let term = rtt * (2.0 * p / 3.0).sqrt()
        + rto * (3.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p));
    segment_size / term
}

/// Numerically invert [`tcp_throughput`] for `p`, with `RTO = 4R`
/// (RFC 5348 §6.3.1): the loss event rate at which the equation yields
/// `target_rate`.
pub fn invert_tcp_throughput(segment_size: f64, rtt: f64, target_rate: f64) -> f64 {
    let rto = 4.0 * rtt;
    // X(p) is strictly decreasing in p, so bisect.
    let (mut lo, mut hi) = (1.0e-8f64, 1.0f64);
    if tcp_throughput(segment_size, rtt, rto, lo) <= target_rate {
        return lo;
    }
    if tcp_throughput(segment_size, rtt, rto, hi) >= target_rate {
        return hi;
    }
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        if tcp_throughput(segment_size, rtt, rto, mid) > target_rate {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

// ─── Receive Rate Set ───────────────────────────────────────────────────────

/// The bounded set of recent `X_recv` samples (RFC 5348 §4.3, `X_recv_set`).
#[derive(Debug, Clone)]
pub struct ReceiveRateSet {
    entries: Vec<(Timestamp, f64)>,
}

impl ReceiveRateSet {
    /// Fresh set holding the initial infinite entry, which lifts the receive
    /// limit until real samples arrive.
    pub fn new() -> Self {
        ReceiveRateSet {
            entries: vec![(Timestamp::from_millis(0), f64::INFINITY)],
        }
    }

    /// Fresh set seeded with one concrete sample (no-feedback backoff path).
    pub fn seeded(receive_rate: f64, timestamp: Timestamp) -> Self {
        ReceiveRateSet {
            entries: vec![(timestamp, receive_rate)],
        }
    }

    /// Halve every entry in place.
    pub fn halve(&mut self) {
        for (_, rate) in &mut self.entries {
            *rate /= 2.0;
        }
    }

    /// Largest entry in the set.
    pub fn max_receive_rate(&self) -> f64 {
        self.entries
            .iter()
            .map(|(_, rate)| *rate)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Data-limited maximize step: add the sample, drop the initial infinity,
    /// then collapse to the single largest entry stamped `now`.
    pub fn maximize(&mut self, receive_rate: f64, now: Timestamp) {
        self.push((now, receive_rate));
        if self.entries.first().is_some_and(|(_, r)| r.is_infinite()) {
            self.entries.remove(0);
        }
        let max = self.max_receive_rate();
        self.entries = vec![(now, max)];
    }

    /// Regular update step: add the sample and expire entries older than two
    /// round-trip times.
    pub fn update(&mut self, receive_rate: f64, rtt: Duration, now: Timestamp) {
        self.push((now, receive_rate));
        self.entries
            .retain(|(at, _)| now.duration_since(*at) < 2 * rtt);
    }

    fn push(&mut self, entry: (Timestamp, f64)) {
        self.entries.push(entry);
        // Limit to the 3 most recent entries.
        if self.entries.len() > 3 {
            let excess = self.entries.len() - 3;
            self.entries.drain(..excess);
        }
    }
}

impl Default for ReceiveRateSet {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// Feedback fields as consumed by the sender, clock-converted by the caller.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackReport {
    /// Echoed sender timestamp.
    pub timestamp: Timestamp,
    /// Receiver-side hold time between receipt and feedback send.
    pub delay: Duration,
    /// Estimated receive rate, bytes/second.
    pub receive_rate: f64,
    /// Loss event rate `p`.
    pub loss_event_rate: f64,
}

/// One pacing decision from the credit loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Credit {
    /// Send one segment now, tagged with this sequence number.
    Send(SequenceNumber),
    /// Sleep this long and poll again.
    Wait(Duration),
}

/// TFRC sender state machine (RFC 5348 §4).
pub struct TfrcSender {
    /// Segment size `s` in bytes.
    segment_size: f64,
    /// Allowed sending rate `X`, bytes/second.
    allowed_sending_rate: f64,
    /// `X` right after the initial window was applied; slow-start floor.
    initial_allowed_sending_rate: Option<f64>,
    /// When `X` was last doubled during slow-start.
    time_last_doubled: Option<Timestamp>,
    /// Smoothed RTT in seconds, `None` until the first feedback.
    rtt: Option<f64>,
    rto: Option<f64>,
    recv_set: ReceiveRateSet,
    loss_event_rate: f64,
    tcp_sending_rate: Option<f64>,
    // Data-limited interval bookkeeping (RFC 5348 §8.2.1).
    not_limited1: Timestamp,
    not_limited2: Timestamp,
    t_new: Timestamp,
    t_next: Timestamp,
    data_limited: bool,
    no_feedback_deadline: Timestamp,
    // Credit pacing.
    next_send_at: Timestamp,
    next_sequence: SequenceNumber,
}

impl TfrcSender {
    pub fn new(segment_size: usize, now: Timestamp) -> Self {
        let segment_size = segment_size as f64;
        TfrcSender {
            segment_size,
            // Before any feedback: one segment per second (RFC 5348 §4.2).
            allowed_sending_rate: segment_size,
            initial_allowed_sending_rate: None,
            time_last_doubled: None,
            rtt: None,
            rto: None,
            recv_set: ReceiveRateSet::new(),
            loss_event_rate: 0.0,
            tcp_sending_rate: None,
            not_limited1: Timestamp::from_millis(0),
            not_limited2: Timestamp::from_millis(0),
            t_new: Timestamp::from_millis(0),
            t_next: Timestamp::from_millis(0),
            data_limited: false,
            no_feedback_deadline: now + Duration::from_secs(2),
            next_send_at: now,
            next_sequence: SequenceNumber::new(0),
        }
    }

    /// Current allowed sending rate in bytes/second.
    pub fn allowed_sending_rate(&self) -> f64 {
        self.allowed_sending_rate
    }

    /// Smoothed RTT estimate, once feedback has provided one.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.map(Duration::from_secs_f64)
    }

    pub fn loss_event_rate(&self) -> f64 {
        self.loss_event_rate
    }

    /// Process one feedback report (RFC 5348 §4.3).
    pub fn handle_feedback(&mut self, report: FeedbackReport, now: Timestamp) {
        self.check_no_feedback_timer(now);

        let previous_rtt = self.rtt;
        self.update_rtt(report.timestamp, report.delay, now);
        let rtt = self.rtt.expect("update_rtt always sets an estimate");
        let previous_loss_event_rate = self.loss_event_rate;
        self.loss_event_rate = report.loss_event_rate;
        self.rto = Some((4.0 * rtt).max(2.0 * self.segment_size / self.allowed_sending_rate));

        if previous_rtt.is_none() {
            // First feedback: apply the initial window (RFC 5348 §4.2).
            let w_init = (4.0 * self.segment_size).min((2.0 * self.segment_size).max(4380.0));
            self.allowed_sending_rate = w_init / rtt;
            self.initial_allowed_sending_rate = Some(self.allowed_sending_rate);
            self.time_last_doubled = Some(now);
        } else {
            self.update_allowed_sending_rate(
                report.receive_rate,
                Some(previous_loss_event_rate),
                now,
            );
        }

        let rto = self.rto.expect("rto set above");
        self.no_feedback_deadline = now + Duration::from_secs_f64(rto);

        // Data-limited interval bookkeeping (RFC 5348 §8.2.1).
        self.t_new = report.timestamp;
        let t_old = self.t_new - Duration::from_secs_f64(rtt);
        self.t_next = now;
        let in_window = |t: Timestamp| t.is_after(t_old) && !t.is_after(self.t_new);
        self.data_limited = !(in_window(self.not_limited1) || in_window(self.not_limited2));

        if !self.not_limited1.is_after(self.t_new) && self.t_new.is_before(self.not_limited2) {
            self.not_limited1 = self.not_limited2;
        }
    }

    /// Poll the paced credit loop (RFC 5348 §4.6, §8.2, §8.3). Returns either
    /// one send credit or how long to sleep before polling again.
    pub fn poll_credit(&mut self, now: Timestamp) -> Credit {
        self.check_no_feedback_timer(now);

        let inter_packet_interval = self.segment_size / self.allowed_sending_rate;
        let t_delta = inter_packet_interval
            .min(SCHEDULING_GRANULARITY.as_secs_f64())
            .min(self.rtt.unwrap_or(f64::INFINITY))
            / 2.0;

        let interval = Duration::from_secs_f64(inter_packet_interval);
        let fire_at = self.next_send_at - Duration::from_secs_f64(t_delta);
        if now.is_after(fire_at) {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.next();
            self.next_send_at = self.next_send_at + interval;
            if now.is_after(self.next_send_at + interval) {
                // The loop stalled; re-anchor instead of bursting backlog.
                self.next_send_at = now;
            }
            Credit::Send(sequence)
        } else {
            // Not data-limited at this instant; record it for §8.2.1.
            if !self.not_limited1.is_after(self.t_new) {
                self.not_limited1 = self.t_new;
            } else if !self.not_limited2.is_after(self.t_next) {
                self.not_limited2 = now;
            }
            Credit::Wait(SCHEDULING_GRANULARITY)
        }
    }

    /// Expiry handling for the no-feedback timer (RFC 5348 §4.4).
    fn check_no_feedback_timer(&mut self, now: Timestamp) {
        if self.no_feedback_deadline.is_after(now) {
            return;
        }
        let receive_rate = self.recv_set.max_receive_rate();
        let floor = self.segment_size / MAXIMUM_BACKOFF_INTERVAL;

        if self.rtt.is_none() || self.loss_event_rate == 0.0 {
            // Never connected, or loss-free so far: plain halving.
            self.allowed_sending_rate = (self.allowed_sending_rate / 2.0).max(floor);
        } else {
            let tcp_rate = self.tcp_sending_rate.unwrap_or(f64::INFINITY);
            let timer_limit = if tcp_rate > 2.0 * receive_rate {
                receive_rate
            } else {
                tcp_rate / 2.0
            };
            self.recv_set = ReceiveRateSet::seeded(timer_limit.max(floor) / 2.0, now);
            self.update_allowed_sending_rate(receive_rate, None, now);
        }

        let rtt = self.rtt.unwrap_or(0.0);
        let backoff = (4.0 * rtt).max(2.0 * self.segment_size / self.allowed_sending_rate);
        self.no_feedback_deadline = now + Duration::from_secs_f64(backoff);
    }

    fn update_rtt(&mut self, echoed: Timestamp, delay: Duration, now: Timestamp) {
        let sample = now
            .duration_since(echoed)
            .saturating_sub(delay)
            .as_secs_f64();
        const Q: f64 = 0.9;
        self.rtt = Some(match self.rtt {
            None => sample,
            Some(rtt) => Q * rtt + (1.0 - Q) * sample,
        });
    }

    /// Recompute `X` from the throughput equation and the receive-rate limit
    /// (RFC 5348 §4.3).
    fn update_allowed_sending_rate(
        &mut self,
        receive_rate: f64,
        previous_loss_event_rate: Option<f64>,
        now: Timestamp,
    ) {
        let rtt = match self.rtt {
            Some(rtt) => rtt,
            None => return,
        };
        let previous_loss_event_rate = previous_loss_event_rate.unwrap_or(self.loss_event_rate);

        let recv_limit = if self.data_limited {
            if previous_loss_event_rate < self.loss_event_rate {
                // New loss during a data-limited interval.
                self.recv_set.halve();
                self.recv_set.maximize(receive_rate * 0.85, now);
                self.recv_set.max_receive_rate()
            } else {
                self.recv_set.maximize(receive_rate, now);
                self.recv_set.max_receive_rate()
            }
        } else {
            self.recv_set
                .update(receive_rate, Duration::from_secs_f64(rtt), now);
            2.0 * self.recv_set.max_receive_rate()
        };

        let floor = self.segment_size / MAXIMUM_BACKOFF_INTERVAL;
        if self.loss_event_rate > 0.0 {
            let rto = self
                .rto
                .unwrap_or((4.0 * rtt).max(2.0 * self.segment_size / self.allowed_sending_rate));
            let tcp_rate = tcp_throughput(self.segment_size, rtt, rto, self.loss_event_rate);
            self.tcp_sending_rate = Some(tcp_rate);
            self.allowed_sending_rate = tcp_rate.min(recv_limit).max(floor);
        } else if self
            .time_last_doubled
            .is_none_or(|last| now.duration_since(last).as_secs_f64() >= rtt)
        {
            // Slow-start: double once per RTT until the first loss event.
            let doubled = (2.0 * self.allowed_sending_rate).min(recv_limit);
            self.allowed_sending_rate =
                doubled.max(self.initial_allowed_sending_rate.unwrap_or(floor));
            self.time_last_doubled = Some(now);
        }
    }
}
