//! # Reusable One-Shot Timer
//!
//! A deadline object distinct from a plain sleep: it can be reset while
//! pending, fired early from the outside, and cleared, with a persistent
//! listener list. Listeners are synchronous callbacks receiving
//! `expired_early` — `true` when [`Timer::expire`] preempted the deadline,
//! `false` on a natural expiry. The backing task is aborted on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle for removing a subscribed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    listeners: HashMap<u64, Listener>,
    next_id: u64,
}

/// A resettable, externally fireable one-shot timer.
pub struct Timer {
    state: Arc<Mutex<TimerState>>,
    poke: Arc<Notify>,
    waiter: JoinHandle<()>,
}

impl Timer {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(TimerState::default()));
        let poke = Arc::new(Notify::new());
        let waiter = tokio::spawn(Self::wait_loop(state.clone(), poke.clone()));
        Timer {
            state,
            poke,
            waiter,
        }
    }

    /// Arm (or re-arm) the timer `timeout` from now, replacing any pending
    /// deadline. Listeners persist across resets.
    pub fn reset(&self, timeout: Duration) {
        self.state.lock().unwrap().deadline = Some(Instant::now() + timeout);
        self.poke.notify_one();
    }

    /// Fire immediately, preempting any pending deadline. Listeners observe
    /// `expired_early = true`.
    pub fn expire(&self) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            state.deadline = None;
            state.listeners.values().cloned().collect::<Vec<_>>()
        };
        self.poke.notify_one();
        for listener in listeners {
            listener(true);
        }
    }

    /// Drop any pending deadline without firing.
    pub fn clear(&self) {
        self.state.lock().unwrap().deadline = None;
        self.poke.notify_one();
    }

    /// Register a synchronous listener; it must not block.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> ListenerId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, Arc::new(listener));
        ListenerId(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.state.lock().unwrap().listeners.remove(&id.0);
    }

    /// Whether a deadline is currently pending.
    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().deadline.is_some()
    }

    async fn wait_loop(state: Arc<Mutex<TimerState>>, poke: Arc<Notify>) {
        loop {
            let deadline = state.lock().unwrap().deadline;
            match deadline {
                None => poke.notified().await,
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            let listeners = {
                                let mut state = state.lock().unwrap();
                                // Only fire if the deadline we slept on is
                                // still the current one.
                                if state.deadline != Some(at) {
                                    continue;
                                }
                                state.deadline = None;
                                state.listeners.values().cloned().collect::<Vec<_>>()
                            };
                            for listener in listeners {
                                listener(false);
                            }
                        }
                        _ = poke.notified() => {}
                    }
                }
            }
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.waiter.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn recording_listener(timer: &Timer) -> (ListenerId, mpsc::UnboundedReceiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = timer.subscribe(move |early| {
            let _ = tx.send(early);
        });
        (id, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_deadline() {
        let timer = Timer::new();
        let (_id, mut rx) = recording_listener(&timer);
        timer.reset(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(rx.try_recv(), Ok(false), "natural expiry is not early");
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_replaces_pending_deadline() {
        let timer = Timer::new();
        let (_id, mut rx) = recording_listener(&timer);
        timer.reset(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Push the deadline out; the original one must not fire.
        timer.reset(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "old deadline must not fire");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv(), Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_fires_immediately_with_early_flag() {
        let timer = Timer::new();
        let (_id, mut rx) = recording_listener(&timer);
        timer.reset(Duration::from_secs(60));
        timer.expire();
        assert_eq!(rx.try_recv(), Ok(true), "expire() reports early");

        // The preempted deadline is gone.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_without_firing() {
        let timer = Timer::new();
        let (_id, mut rx) = recording_listener(&timer);
        timer.reset(Duration::from_millis(20));
        timer.clear();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_persist_across_resets() {
        let timer = Timer::new();
        let (_id, mut rx) = recording_listener(&timer);
        for _ in 0..3 {
            timer.reset(Duration::from_millis(10));
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(rx.try_recv(), Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_delivery() {
        let timer = Timer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let id = timer.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        timer.reset(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timer.unsubscribe(id);
        timer.reset(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_listeners_all_fire() {
        let timer = Timer::new();
        let (_a, mut rx_a) = recording_listener(&timer);
        let (_b, mut rx_b) = recording_listener(&timer);
        timer.reset(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(rx_a.try_recv(), Ok(false));
        assert_eq!(rx_b.try_recv(), Ok(false));
    }
}
