//! Eviction policy abstraction.
//!
//! A policy keeps an ordered candidate stream; `eject_next_candidate`
//! walks it in eviction order, letting the caller veto individual records.
//! The policy set is closed (today: LRU), modeled as a tagged union.

use crate::Fingerprint;
use std::collections::VecDeque;

/// Caller verdict for one ejection candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EjectVerdict {
    /// Remove the record from the policy and keep iterating.
    Evict,
    /// Remove the record and stop: enough space reclaimed.
    EvictAndStop,
    /// Leave the record in place and move to the next candidate.
    Keep,
}

/// Least-recently-used policy over fingerprints.
///
/// Kept as a plain deque under the partition lock; no per-record lock.
/// `upvote` moves a record to the tail, eviction iterates from the head.
#[derive(Debug, Default)]
pub struct LruPolicy {
    order: VecDeque<Fingerprint>,
}

impl LruPolicy {
    fn remove_key(&mut self, key: &Fingerprint) -> bool {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let _ = self.order.remove(pos);
            return true;
        }
        false
    }
}

/// The closed set of eviction policies.
#[derive(Debug)]
pub enum EvictionPolicy {
    Lru(LruPolicy),
}

impl EvictionPolicy {
    #[must_use]
    pub fn lru() -> Self {
        Self::Lru(LruPolicy::default())
    }

    /// Track a new record. The record starts at the coldest-safe position
    /// a fresh entry gets under the policy (LRU: the tail).
    pub fn add(&mut self, key: Fingerprint) {
        match self {
            Self::Lru(p) => p.order.push_back(key),
        }
    }

    /// The record was touched; make it less likely to be evicted.
    pub fn upvote(&mut self, key: &Fingerprint) {
        match self {
            Self::Lru(p) => {
                if p.remove_key(key) {
                    p.order.push_back(key.clone());
                }
            }
        }
    }

    /// Make the record an earlier eviction candidate.
    pub fn downvote(&mut self, key: &Fingerprint) {
        match self {
            Self::Lru(p) => {
                if p.remove_key(key) {
                    p.order.push_front(key.clone());
                }
            }
        }
    }

    /// Stop tracking a record (deleted or invalidated by the cache).
    pub fn remove(&mut self, key: &Fingerprint) {
        match self {
            Self::Lru(p) => {
                let _ = p.remove_key(key);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Lru(p) => p.order.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk ejection candidates in policy order, applying `filter` to each.
    ///
    /// A record is removed from the policy iff the filter says to evict it;
    /// kept records stay in place and iteration moves past them.
    pub fn eject_next_candidate(&mut self, mut filter: impl FnMut(&Fingerprint) -> EjectVerdict) {
        match self {
            Self::Lru(p) => {
                let mut kept: Vec<Fingerprint> = Vec::new();
                while let Some(key) = p.order.pop_front() {
                    match filter(&key) {
                        EjectVerdict::Evict => {}
                        EjectVerdict::EvictAndStop => break,
                        EjectVerdict::Keep => kept.push(key),
                    }
                }
                // Kept records retain their relative age at the cold end.
                for key in kept.into_iter().rev() {
                    p.order.push_front(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s.as_bytes())
    }

    #[test]
    fn lru_evicts_oldest_first() {
        let mut policy = EvictionPolicy::lru();
        policy.add(fp("a"));
        policy.add(fp("b"));
        policy.add(fp("c"));

        let mut order = Vec::new();
        policy.eject_next_candidate(|k| {
            order.push(k.clone());
            EjectVerdict::Evict
        });
        assert_eq!(order, vec![fp("a"), fp("b"), fp("c")]);
        assert!(policy.is_empty());
    }

    #[test]
    fn upvote_moves_to_tail() {
        let mut policy = EvictionPolicy::lru();
        policy.add(fp("a"));
        policy.add(fp("b"));
        policy.upvote(&fp("a"));

        let mut first = None;
        policy.eject_next_candidate(|k| {
            first = Some(k.clone());
            EjectVerdict::EvictAndStop
        });
        assert_eq!(first, Some(fp("b")));
    }

    #[test]
    fn kept_records_stay_in_order() {
        let mut policy = EvictionPolicy::lru();
        policy.add(fp("a"));
        policy.add(fp("b"));
        policy.add(fp("c"));

        // Veto "a", evict "b", then stop.
        let mut seen = Vec::new();
        policy.eject_next_candidate(|k| {
            seen.push(k.clone());
            if k == &fp("a") {
                EjectVerdict::Keep
            } else {
                EjectVerdict::EvictAndStop
            }
        });
        assert_eq!(seen, vec![fp("a"), fp("b")]);
        assert_eq!(policy.len(), 2); // "a" kept, "c" untouched

        let mut next = None;
        policy.eject_next_candidate(|k| {
            next = Some(k.clone());
            EjectVerdict::EvictAndStop
        });
        assert_eq!(next, Some(fp("a")));
    }

    #[test]
    fn downvote_moves_to_head() {
        let mut policy = EvictionPolicy::lru();
        policy.add(fp("a"));
        policy.add(fp("b"));
        policy.downvote(&fp("b"));

        let mut first = None;
        policy.eject_next_candidate(|k| {
            first = Some(k.clone());
            EjectVerdict::EvictAndStop
        });
        assert_eq!(first, Some(fp("b")));
    }
}
