// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Endpoint selection strategies.
//!
//! A strategy picks one endpoint out of the set that survived the
//! availability filter (node alive, circuit not open). Strategies are
//! pure with respect to the catalog: they see only a projection of the
//! candidates and keep whatever cursor state they need behind interior
//! mutability, so selection runs under a shared registry lock.

use rand::Rng;

use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Projection of one selectable endpoint, handed to strategies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate<'a> {
    /// Id of the hosting node.
    pub node_id: &'a str,
    /// Is the endpoint hosted by the local node?
    pub local: bool,
}

/// Chooser of one endpoint among the available candidates.
pub trait Strategy: Send + Sync + fmt::Debug {
    /// Returns the index of the chosen candidate, or `None` when the
    /// slice is empty.
    fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize>;
}

/// Creates fresh strategy instances, one per action entry / event group.
pub type StrategyFactory = fn() -> Box<dyn Strategy>;

/// Cycles through the candidates in order. The default strategy.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Creates a boxed instance; usable as a [`StrategyFactory`].
    pub fn factory() -> Box<dyn Strategy> {
        Box::new(Self::default())
    }
}

impl Strategy for RoundRobin {
    fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(cursor % candidates.len())
    }
}

/// Picks a uniformly random candidate.
#[derive(Debug, Default)]
pub struct Random;

impl Random {
    /// Creates a boxed instance; usable as a [`StrategyFactory`].
    pub fn factory() -> Box<dyn Strategy> {
        Box::new(Self)
    }
}

impl Strategy for Random {
    fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn candidates<'a>(ids: &'a [&'a str]) -> Vec<Candidate<'a>> {
        ids.iter()
            .map(|node_id| Candidate {
                node_id,
                local: false,
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let strategy = RoundRobin::default();
        let candidates = candidates(&["a", "b", "c"]);
        let picks: Vec<_> = (0..6)
            .map(|_| strategy.select(&candidates).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn round_robin_adapts_to_shrinking_sets() {
        let strategy = RoundRobin::default();
        let three = candidates(&["a", "b", "c"]);
        strategy.select(&three);
        strategy.select(&three);

        // One endpoint dropped out; picks stay within bounds.
        let two = candidates(&["a", "b"]);
        for _ in 0..4 {
            assert!(strategy.select(&two).unwrap() < 2);
        }
    }

    #[test]
    fn empty_set_selects_nothing() {
        assert_eq!(RoundRobin::default().select(&[]), None);
        assert_eq!(Random.select(&[]), None);
    }

    #[test]
    fn random_stays_in_bounds() {
        let candidates = candidates(&["a", "b"]);
        for _ in 0..50 {
            assert!(Random.select(&candidates).unwrap() < 2);
        }
    }
}
