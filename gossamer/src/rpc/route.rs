// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Provider selection for the client pool.

use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Which selection policy the pool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum Strategy {
    /// Uniform random choice.
    #[default]
    Random,
    /// Monotonic counter modulo candidate count.
    RoundRobin,
    /// Stable hash of a caller key modulo count: the same caller keeps
    /// hitting the same provider while the list is unchanged.
    HashIp,
}

pub trait RouteStrategy<T>: Send + Sync {
    /// Pick one of `candidates`. Must not be called with an empty slice.
    fn select<'a>(&self, candidates: &'a [T]) -> &'a T;
}

#[derive(Debug)]
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RouteStrategy<T> for RandomStrategy {
    fn select<'a>(&self, candidates: &'a [T]) -> &'a T {
        assert!(!candidates.is_empty(), "no candidates to select from");
        let idx = self.rng.lock().expect("rng lock").gen_range(0..candidates.len());
        &candidates[idx]
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> RouteStrategy<T> for RoundRobinStrategy {
    fn select<'a>(&self, candidates: &'a [T]) -> &'a T {
        assert!(!candidates.is_empty(), "no candidates to select from");
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        &candidates[idx]
    }
}

#[derive(Debug)]
pub struct HashIpStrategy {
    key: String,
}

impl HashIpStrategy {
    /// `key` identifies the caller (its address, typically).
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl<T> RouteStrategy<T> for HashIpStrategy {
    fn select<'a>(&self, candidates: &'a [T]) -> &'a T {
        assert!(!candidates.is_empty(), "no candidates to select from");
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % candidates.len();
        &candidates[idx]
    }
}

/// Build the boxed strategy for `kind`; `hash_key` feeds [`HashIpStrategy`].
#[must_use]
pub fn make_strategy<T: 'static>(
    kind: Strategy,
    hash_key: impl Into<String>,
) -> Box<dyn RouteStrategy<T>> {
    match kind {
        Strategy::Random => Box::new(RandomStrategy::new()),
        Strategy::RoundRobin => Box::new(RoundRobinStrategy::new()),
        Strategy::HashIp => Box::new(HashIpStrategy::new(hash_key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CANDIDATES: [i32; 5] = [1, 2, 3, 4, 5];

    #[test]
    fn random_covers_all_candidates_with_a_seeded_rng() {
        let strategy = RandomStrategy::with_seed(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(*strategy.select(&CANDIDATES));
        }
        assert_eq!(seen.len(), CANDIDATES.len());
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let strategy = RoundRobinStrategy::new();
        let picks: Vec<i32> = (0..7).map(|_| *strategy.select(&CANDIDATES)).collect();
        assert_eq!(picks, vec![1, 2, 3, 4, 5, 1, 2]);
    }

    #[test]
    fn hash_ip_is_stable_per_key() {
        let a = HashIpStrategy::new("10.0.0.1:4242");
        let first = *a.select(&CANDIDATES);
        for _ in 0..10 {
            assert_eq!(*a.select(&CANDIDATES), first);
        }
        // A different key may land elsewhere, but is itself stable.
        let b = HashIpStrategy::new("10.0.0.2:4242");
        let other = *b.select(&CANDIDATES);
        assert_eq!(*b.select(&CANDIDATES), other);
    }
}
