//! Property-Based Tests for the Memory Tier
//!
//! # Test Properties
//!
//! 1. **Budget**: resident bytes never exceed the budget after any mutation
//! 2. **Accounting**: the byte counter equals the sum of resident sizes
//! 3. **Freshness**: a lookup never returns an expired value

#![cfg(test)]

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use super::entry::CacheEntry;
use super::memory::{Lookup, MemoryTier};
use super::policy::EvictionStrategy;

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Set { key: u8, size: u64, ttl_secs: u64 },
    Get { key: u8 },
    Remove { key: u8 },
    Advance { secs: i64 },
    Purge,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..16, 1u64..400, 1u64..120)
            .prop_map(|(key, size, ttl_secs)| Op::Set { key, size, ttl_secs }),
        4 => (0u8..16).prop_map(|key| Op::Get { key }),
        1 => (0u8..16).prop_map(|key| Op::Remove { key }),
        2 => (1i64..60).prop_map(|secs| Op::Advance { secs }),
        1 => Just(Op::Purge),
    ]
}

fn strategy_strategy() -> impl Strategy<Value = EvictionStrategy> {
    prop_oneof![
        Just(EvictionStrategy::Lru),
        Just(EvictionStrategy::Fifo),
        Just(EvictionStrategy::Adaptive),
    ]
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

// =============================================================================
// Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_memory_never_exceeds_budget(
        budget in 100u64..2000,
        strategy in strategy_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let mut tier: MemoryTier<u64> = MemoryTier::new(budget, strategy.build());
        // key -> (size, created, ttl) of what should be resident
        let mut shadow: HashMap<String, (u64, i64, u64)> = HashMap::new();
        let mut now_secs = 0i64;

        for op in ops {
            let now = at(now_secs);
            match op {
                Op::Set { key, size, ttl_secs } => {
                    let key = format!("k{}", key);
                    let entry = CacheEntry::new(key.clone(), size, Duration::from_secs(ttl_secs), now);
                    let outcome = tier.insert(entry, size, now);
                    for evicted in &outcome.evicted {
                        shadow.remove(evicted);
                    }
                    shadow.remove(&key);
                    if outcome.admitted {
                        shadow.insert(key, (size, now_secs, ttl_secs));
                    } else {
                        prop_assert!(size > budget);
                    }
                }
                Op::Get { key } => {
                    let key = format!("k{}", key);
                    match tier.get(&key, now) {
                        Lookup::Hit(value) => {
                            let (size, created, ttl) = shadow[&key];
                            prop_assert_eq!(value, size);
                            prop_assert!(now_secs - created <= ttl as i64);
                        }
                        Lookup::Expired => {
                            let (_, created, ttl) = shadow.remove(&key).unwrap();
                            prop_assert!(now_secs - created > ttl as i64);
                        }
                        Lookup::Miss => prop_assert!(!shadow.contains_key(&key)),
                    }
                }
                Op::Remove { key } => {
                    let key = format!("k{}", key);
                    prop_assert_eq!(tier.remove(&key).is_some(), shadow.remove(&key).is_some());
                }
                Op::Advance { secs } => now_secs += secs,
                Op::Purge => {
                    tier.purge_expired(now);
                    shadow.retain(|_, (_, created, ttl)| now_secs - *created <= *ttl as i64);
                }
            }

            prop_assert!(tier.size() <= budget);
            prop_assert_eq!(tier.size(), shadow.values().map(|(size, _, _)| size).sum::<u64>());
            prop_assert_eq!(tier.len(), shadow.len());
        }
    }
}
