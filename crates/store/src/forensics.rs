//! Short-lived reply snapshots for crash forensics.
//!
//! In-memory key-value entries (`agent:reply:{id}`) with a TTL. Written
//! on every reply status transition, read only by operators after a
//! crash; the authoritative state lives in the relational stores and the
//! in-memory reply registry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

const PRUNE_THRESHOLD: usize = 10_000;

pub struct ForensicsKv {
    entries: Mutex<HashMap<String, (Value, Instant)>>,
    ttl: Duration,
}

impl ForensicsKv {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn reply_key(reply_id: &uuid::Uuid) -> String {
        format!("agent:reply:{reply_id}")
    }

    pub fn put(&self, key: &str, value: Value) {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        // Lazy cleanup when the map grows large.
        if entries.len() > PRUNE_THRESHOLD {
            let ttl = self.ttl;
            entries.retain(|_, (_, ts)| now.duration_since(*ts) < ttl);
        }

        entries.insert(key.to_owned(), (value, now));
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock();
        let (value, ts) = entries.get(key)?;
        if ts.elapsed() >= self.ttl {
            return None;
        }
        Some(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_roundtrip() {
        let kv = ForensicsKv::new(Duration::from_secs(60));
        kv.put("agent:reply:r1", json!({"status": "running"}));
        assert_eq!(
            kv.get("agent:reply:r1"),
            Some(json!({"status": "running"}))
        );
        assert!(kv.get("agent:reply:r2").is_none());
    }

    #[test]
    fn entries_expire() {
        let kv = ForensicsKv::new(Duration::from_millis(0));
        kv.put("k", json!(1));
        std::thread::sleep(Duration::from_millis(1));
        assert!(kv.get("k").is_none());
    }

    #[test]
    fn overwrite_refreshes_value() {
        let kv = ForensicsKv::new(Duration::from_secs(60));
        kv.put("k", json!(1));
        kv.put("k", json!(2));
        assert_eq!(kv.get("k"), Some(json!(2)));
    }

    #[test]
    fn reply_key_format() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            ForensicsKv::reply_key(&id),
            "agent:reply:00000000-0000-0000-0000-000000000000"
        );
    }
}
