use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Process-wide monotonic millisecond counter: `max(now, last + 1)`.
///
/// Used only for intra-process ordering of `PendingChange::id`; the durable
/// ordering key is always `mutation_id`, never this timestamp (§9).
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    pub fn next(&self) -> i64 {
        let now = now_millis();
        loop {
            let last = self.last.load(Ordering::SeqCst);
            let candidate = now.max(last + 1);
            if self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Recursively sorts object keys so structurally-equal values serialize
/// identically regardless of field insertion order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical hash of a JSON value: equal under key-order-independent
/// structural equality iff the hashes match (§8 invariant 6).
pub fn hash_object(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn monotonic_clock_strictly_increases() {
        let clock = MonotonicClock::new();
        let mut last = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn hash_is_independent_of_key_order() {
        let a = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let b = json!({"b": {"d": 3, "c": 2}, "a": 1});
        assert_eq!(hash_object(&a), hash_object(&b));
    }

    #[test]
    fn hash_differs_for_different_values() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(hash_object(&a), hash_object(&b));
    }
}
