use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use parking_lot::Mutex;

/// Prefix of all activity heartbeat keys.
pub const ACTIVITY_PREFIX: &str = "activity:";

/// Builds the counter key for one (student, subject, day) bucket.
pub fn activity_key(student_id: &str, subject: &str, day: NaiveDate) -> String {
    format!("{ACTIVITY_PREFIX}{student_id}:{subject}:{}", day.format("%Y-%m-%d"))
}

/// Parses an activity key back into its parts. Returns None for keys
/// that do not match the `activity:{student}:{subject}:{date}` shape.
pub fn parse_activity_key(key: &str) -> Option<(String, String, NaiveDate)> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 4 || parts[0] != "activity" {
        return None;
    }
    if parts[1].is_empty() || parts[2].is_empty() {
        return None;
    }
    let day = NaiveDate::parse_from_str(parts[3], "%Y-%m-%d").ok()?;
    Some((parts[1].to_string(), parts[2].to_string(), day))
}

enum Value {
    Count(i64),
    Text(String),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process TTL'd key/value store for high-frequency counters.
///
/// Holds the activity heartbeat counters and the plan-details cache.
/// Expired entries are evicted lazily on access and during scans. All
/// operations take the internal lock once, so single-key increments are
/// atomic with respect to each other and to the sync scan.
pub struct CounterStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Atomically adds `delta` to the counter at `key`, creating it at
    /// zero if absent or expired, and refreshes its TTL. Returns the new
    /// value.
    pub fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> i64 {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let current = match entries.get(key) {
            Some(entry) if !entry.expired(now) => match entry.value {
                Value::Count(n) => n,
                Value::Text(_) => 0,
            },
            _ => 0,
        };

        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Count(next),
                expires_at: now + ttl,
            },
        );
        next
    }

    /// Current counter value, or None if absent or expired.
    pub fn get_count(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                None
            }
            Some(Entry {
                value: Value::Count(n),
                ..
            }) => Some(*n),
            _ => None,
        }
    }

    /// Stores a string payload under `key` with the given TTL.
    pub fn set_text(&self, key: &str, value: String, ttl: Duration) {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value),
                expires_at: now + ttl,
            },
        );
    }

    /// Fetches a string payload, or None if absent or expired.
    pub fn get_text(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                None
            }
            Some(Entry {
                value: Value::Text(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }
    }

    /// Returns one page of live counters whose keys start with `prefix`,
    /// in key order, starting strictly after `cursor`.
    ///
    /// The returned cursor is the last key yielded, or None when the
    /// prefix range is exhausted. A scan restarted from an older cursor
    /// may re-yield keys; callers must tolerate that. Expired entries
    /// encountered along the way are evicted.
    pub fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> (Vec<(String, i64)>, Option<String>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let start = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut page = Vec::with_capacity(limit);
        let mut expired = Vec::new();

        for (key, entry) in entries.range::<String, _>((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if entry.expired(now) {
                expired.push(key.clone());
                continue;
            }
            if let Value::Count(n) = entry.value {
                page.push((key.clone(), n));
                if page.len() == limit {
                    break;
                }
            }
        }

        for key in expired {
            entries.remove(&key);
        }

        let next = if page.len() == limit {
            page.last().map(|(k, _)| k.clone())
        } else {
            None
        };

        (page, next)
    }

    /// Number of live entries. Diagnostic only.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.expired(now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
