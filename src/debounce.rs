//! Vote/cooldown gate in front of the event dispatcher.
//!
//! A payload is confirmed only after `threshold` consecutive observations,
//! and the same payload is not confirmed again until `cooldown` has passed.
//! One `Debouncer` exists per camera and is owned by that camera's decode
//! loop, so it needs no locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_VOTE_THRESHOLD: u32 = 2;
pub const DEFAULT_EVENT_COOLDOWN: Duration = Duration::from_millis(3000);

#[derive(Debug)]
pub struct Debouncer {
    threshold: u32,
    cooldown: Duration,
    votes: HashMap<String, u32>,
    last_emitted: HashMap<String, Instant>,
    last_payload: Option<String>,
}

impl Debouncer {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            votes: HashMap::new(),
            last_emitted: HashMap::new(),
            last_payload: None,
        }
    }

    /// Record one observation of `payload` now. Returns true when it should
    /// be emitted as a confirmed event.
    pub fn vote(&mut self, payload: &str) -> bool {
        self.vote_at(payload, Instant::now())
    }

    /// Record one observation of `payload` at `now`.
    pub fn vote_at(&mut self, payload: &str, now: Instant) -> bool {
        // Agreement must be consecutive: a different code starts a new round.
        if self.last_payload.as_deref() != Some(payload) {
            self.votes.clear();
            self.last_payload = Some(payload.to_string());
        }

        let count = self.votes.entry(payload.to_string()).or_insert(0);
        *count += 1;
        if *count < self.threshold {
            return false;
        }

        let cooling = self
            .last_emitted
            .get(payload)
            .is_some_and(|last| now.saturating_duration_since(*last) < self.cooldown);
        if cooling {
            *count = 1;
            return false;
        }

        self.votes.clear();
        self.last_emitted.insert(payload.to_string(), now);
        true
    }

    /// Current consecutive vote count for `payload`.
    pub fn votes(&self, payload: &str) -> u32 {
        self.votes.get(payload).copied().unwrap_or(0)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Forget cooldown stamps older than the window so the map stays small
    /// for long-running cameras that see many distinct codes.
    pub fn prune(&mut self, now: Instant) {
        let cooldown = self.cooldown;
        self.last_emitted
            .retain(|_, last| now.saturating_duration_since(*last) < cooldown);
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_VOTE_THRESHOLD, DEFAULT_EVENT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_observation_does_not_emit() {
        let mut d = Debouncer::default();
        assert!(!d.vote_at("PKG-1", Instant::now()));
        assert_eq!(d.votes("PKG-1"), 1);
    }

    #[test]
    fn cooldown_suppresses_repeats_then_allows_fresh_round() {
        let mut d = Debouncer::default();
        let t0 = Instant::now();

        let emitted: Vec<bool> = (0..4)
            .map(|i| d.vote_at("PKG-1", t0 + Duration::from_millis(100 * i)))
            .collect();
        assert_eq!(emitted, vec![false, true, false, false]);

        let later = t0 + Duration::from_millis(3500);
        assert!(d.vote_at("PKG-1", later));
        assert!(!d.vote_at("PKG-1", later + Duration::from_millis(50)));
    }

    #[test]
    fn fresh_round_after_cooldown_needs_two_votes() {
        let mut d = Debouncer::default();
        let t0 = Instant::now();
        assert!(!d.vote_at("PKG-1", t0));
        assert!(d.vote_at("PKG-1", t0 + Duration::from_millis(30)));

        let later = t0 + Duration::from_secs(10);
        assert!(!d.vote_at("PKG-1", later));
        assert!(d.vote_at("PKG-1", later + Duration::from_millis(30)));
    }

    #[test]
    fn switching_payload_does_not_leak_votes() {
        let mut d = Debouncer::default();
        let t0 = Instant::now();
        assert!(!d.vote_at("A", t0));
        assert!(!d.vote_at("B", t0));
        assert_eq!(d.votes("A"), 0);
        assert_eq!(d.votes("B"), 1);
        assert!(d.vote_at("B", t0));
    }

    #[test]
    fn alternating_payloads_never_confirm() {
        let mut d = Debouncer::default();
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(!d.vote_at("A", t0));
            assert!(!d.vote_at("B", t0));
        }
    }

    #[test]
    fn cooldown_is_per_payload() {
        let mut d = Debouncer::default();
        let t0 = Instant::now();
        d.vote_at("A", t0);
        assert!(d.vote_at("A", t0));
        d.vote_at("B", t0);
        assert!(d.vote_at("B", t0));
    }

    #[test]
    fn prune_drops_expired_stamps() {
        let mut d = Debouncer::default();
        let t0 = Instant::now();
        d.vote_at("A", t0);
        d.vote_at("A", t0);
        d.prune(t0 + Duration::from_secs(5));
        assert!(d.last_emitted.is_empty());
    }
}
