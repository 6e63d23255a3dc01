//! Deduplicating work queue with delayed and rate-limited adds
//!
//! A key is in at most one of three places: ready in the queue, held by a
//! worker, or waiting for a deadline. Adding a key that is already queued is
//! a no-op; adding a key that is held by a worker marks it dirty so it is
//! queued again once the worker calls [`WorkQueue::done`]. This keeps every
//! key strictly serialized while collapsing bursts of events into one pass.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use super::rate_limiter::RateLimiter;
use crate::metrics;

#[derive(Default)]
struct State {
    /// Keys ready to be handed out, oldest first
    queue: VecDeque<String>,
    /// Keys needing a pass; everything in `queue` plus re-added in-flight keys
    dirty: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    /// Deadline of every delayed key
    waiting: HashMap<String, Instant>,
    /// Same entries as `waiting`, ordered by deadline
    deadlines: BTreeSet<(Instant, String)>,
    shutting_down: bool,
}

impl State {
    /// Returns true if the key became visible to `get`
    fn insert(&mut self, key: String) -> bool {
        if !self.dirty.insert(key.clone()) {
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Returns true if `at` became the earliest deadline of the key
    fn schedule(&mut self, key: String, at: Instant) -> bool {
        if let Some(existing) = self.waiting.get(&key) {
            if *existing <= at {
                return false;
            }
            self.deadlines.remove(&(*existing, key.clone()));
        }
        self.waiting.insert(key.clone(), at);
        self.deadlines.insert((at, key));
        true
    }

    fn promote_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.deadlines.first() {
            if *at > now {
                break;
            }
            if let Some((_, key)) = self.deadlines.pop_first() {
                self.waiting.remove(&key);
                self.insert(key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(at, _)| *at)
    }
}

/// Rate-limited work queue of `namespace/name` keys
pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

impl WorkQueue {
    /// Create an empty queue; `name` labels the queue metrics
    pub fn new(name: impl Into<String>, limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            limiter,
        }
    }

    /// Queue name used in logs and metrics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `key` unless it is already queued. Ignored after shutdown.
    pub fn add(&self, key: impl Into<String>) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        metrics::QUEUE_ADDS.with_label_values(&[&self.name]).inc();
        if state.insert(key.into()) {
            self.record_depth(&state);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Queue `key` once `delay` has elapsed. If the key is already waiting,
    /// the earlier deadline wins.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        if state.schedule(key.into(), Instant::now() + delay) {
            drop(state);
            // Waiters sleeping towards a later deadline must re-arm
            self.notify.notify_waiters();
        }
    }

    /// Queue `key` after the rate limiter's cool-down for it
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = self.limiter.when(&key);
        metrics::QUEUE_RETRIES.with_label_values(&[&self.name]).inc();
        self.add_after(key, delay);
    }

    /// Reset the retry counter and backoff of `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    /// Number of rate-limited requeues of `key` since the last `forget`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down
    /// and every queued key has been handed out.
    ///
    /// The caller owns the key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so no wakeup is lost
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                state.promote_expired(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.record_depth(&state);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark the processing of `key` finished. A key re-added while it was
    /// being processed becomes available again now.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            self.record_depth(&state);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting keys and release every waiting `get`. Delayed keys are
    /// discarded; keys already queued are still handed out.
    pub fn shut_down(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        state.waiting.clear();
        state.deadlines.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_depth(&self, state: &State) {
        metrics::QUEUE_DEPTH
            .with_label_values(&[&self.name])
            .set(state.queue.len() as f64);
    }
}
