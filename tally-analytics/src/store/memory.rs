use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::store::{AnalyticsStore, KeyTtl, StoreError};

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, i64>),
    /// Exact set standing in for a cardinality sketch.
    Sketch(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

/// Maximum number of unfinished scans kept. The oldest cursor is dropped beyond this.
const MAX_OPEN_SCANS: usize = 16;

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    scans: BTreeMap<u64, VecDeque<String>>,
    next_cursor: u64,
}

impl Inner {
    /// Removes all expired entries.
    fn sweep(&mut self, now: DateTime<Utc>) {
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|expires_at| expires_at > now));
    }

    /// Keeps the remaining keys of a scan, evicting the oldest scans over the limit.
    fn park_scan(&mut self, cursor: u64, pending: VecDeque<String>) {
        self.scans.insert(cursor, pending);
        while self.scans.len() > MAX_OPEN_SCANS {
            self.scans.pop_first();
        }
    }

    /// Removes `key` if it has expired.
    fn purge(&mut self, key: &str, now: DateTime<Utc>) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|expires_at| expires_at <= now);

        if expired {
            self.entries.remove(key);
        }
    }

    fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        self.purge(key, now);
        self.entries.get_mut(key)
    }

    fn get_or_insert(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
        default: impl FnOnce() -> Value,
    ) -> &mut Entry {
        self.purge(key, now);
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(default()))
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_owned(),
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64, StoreError> {
    value.parse().map_err(|_| wrong_type(key))
}

fn to_delta(ttl: Duration) -> TimeDelta {
    TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX)
}

/// Matches `key` against a Redis glob pattern.
///
/// Supports `*`, `?`, `[...]` classes with ranges and `^` negation, and `\` escapes.
fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern = pattern.as_bytes();
    let key = key.as_bytes();

    let (mut p, mut k) = (0, 0);
    let mut backtrack = None;

    while k < key.len() {
        let step = match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, k));
                p += 1;
                continue;
            }
            Some(b'?') => Some(1),
            Some(b'[') => match_class(&pattern[p + 1..], key[k]).map(|len| len + 1),
            Some(b'\\') if p + 1 < pattern.len() => (pattern[p + 1] == key[k]).then_some(2),
            Some(&c) => (c == key[k]).then_some(1),
            None => None,
        };

        match step {
            Some(len) => {
                p += len;
                k += 1;
            }
            None => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    k = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches `byte` against the class following a `[`.
///
/// Returns the length of the class including its closing `]` on a match. An unterminated class
/// extends to the end of the pattern.
fn match_class(class: &[u8], byte: u8) -> Option<usize> {
    let (negate, mut i) = match class.first() {
        Some(b'^') => (true, 1),
        _ => (false, 0),
    };

    let mut matched = false;
    while i < class.len() && class[i] != b']' {
        if class[i] == b'\\' && i + 1 < class.len() {
            matched |= class[i + 1] == byte;
            i += 2;
        } else if i + 2 < class.len() && class[i + 1] == b'-' && class[i + 2] != b']' {
            let (low, high) = (class[i].min(class[i + 2]), class[i].max(class[i + 2]));
            matched |= (low..=high).contains(&byte);
            i += 3;
        } else {
            matched |= class[i] == byte;
            i += 1;
        }
    }

    let len = if i < class.len() { i + 1 } else { i };
    (matched != negate).then_some(len)
}

/// An in-process implementation of all store capabilities.
///
/// Expiry is evaluated against the injected [`Clock`], so tests can move through time without
/// waiting. Expired keys are dropped when touched and swept whenever a new scan starts. Sketches are exact sets, which keeps every count within any error bound of a
/// real cardinality estimator.
///
/// Clones share the same data.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Creates an empty store evaluating expiry against `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Returns all live keys in lexicographical order.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_none_or(|expires_at| expires_at > now))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl AnalyticsStore for MemoryStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.get(key, now).is_some() {
            return Ok(false);
        }

        let entry = Entry {
            value: Value::Str(value.to_owned()),
            expires_at: now.checked_add_signed(to_delta(ttl)),
        };
        inner.entries.insert(key.to_owned(), entry);
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let entry = inner.get_or_insert(key, now, || Value::Str("0".to_owned()));
        let Value::Str(value) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let next = parse_int(key, value)? + 1;
        *value = next.to_string();
        Ok(next)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.get(key, now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Str(value)) => parse_int(key, value).map(Some),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let entry = inner.get_or_insert(key, now, || Value::Hash(BTreeMap::new()));
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let value = hash.entry(field.to_owned()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.get(key, now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<i64>>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.get(key, now).map(|entry| &entry.value) {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(f).copied()).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.get(key, now).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash.iter().map(|(f, v)| (f.clone(), *v)).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        Ok(self.hget(key, field).await?.is_some())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: i64) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let entry = inner.get_or_insert(key, now, || Value::Hash(BTreeMap::new()));
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        if hash.contains_key(field) {
            return Ok(false);
        }

        hash.insert(field.to_owned(), value);
        Ok(true)
    }

    async fn htake(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let Some(entry) = inner.get(key, now) else {
            return Ok(None);
        };
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let value = hash.remove(field);
        // Like Redis, hashes without fields cease to exist.
        if hash.is_empty() {
            inner.entries.remove(key);
        }

        Ok(value)
    }

    async fn pf_add(&self, key: &str, element: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let entry = inner.get_or_insert(key, now, || Value::Sketch(BTreeSet::new()));
        match &mut entry.value {
            Value::Sketch(set) => Ok(set.insert(element.to_owned())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn pf_count(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.get(key, now).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::Sketch(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn pf_count_union(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let mut union = BTreeSet::new();
        for key in keys {
            match inner.get(key, now).map(|entry| &entry.value) {
                None => (),
                Some(Value::Sketch(set)) => union.extend(set.iter().cloned()),
                Some(_) => return Err(wrong_type(key)),
            }
        }

        Ok(union.len() as u64)
    }

    async fn pf_merge(&self, dest: &str, sources: &[String]) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let mut merged = BTreeSet::new();
        for source in sources {
            match inner.get(source, now).map(|entry| &entry.value) {
                None => (),
                Some(Value::Sketch(set)) => merged.extend(set.iter().cloned()),
                Some(_) => return Err(wrong_type(source)),
            }
        }

        let entry = inner.get_or_insert(dest, now, || Value::Sketch(BTreeSet::new()));
        match &mut entry.value {
            Value::Sketch(set) => set.extend(merged),
            _ => return Err(wrong_type(dest)),
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self.inner.lock().get(key, now).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.get(key, now) {
            Some(entry) => {
                entry.expires_at = now.checked_add_signed(to_delta(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let ttl = match inner.get(key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(expires_at),
                ..
            }) => KeyTtl::Expires((*expires_at - now).to_std().unwrap_or_default()),
        };

        Ok(ttl)
    }

    async fn zincr(&self, key: &str, member: &str, delta: i64) -> Result<f64, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let entry = inner.get_or_insert(key, now, || Value::ZSet(HashMap::new()));
        let Value::ZSet(set) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let score = set.entry(member.to_owned()).or_insert(0.0);
        *score += delta as f64;
        Ok(*score)
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let set = match inner.get(key, now).map(|entry| &entry.value) {
            None => return Ok(Vec::new()),
            Some(Value::ZSet(set)) => set,
            Some(_) => return Err(wrong_type(key)),
        };

        let mut members: Vec<_> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        // Redis orders equal scores lexicographically, reversed for `ZREVRANGE`.
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        members.truncate(limit);
        Ok(members)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let (cursor, mut pending) = if cursor == 0 {
            inner.sweep(now);
            let keys: VecDeque<String> = inner
                .entries
                .keys()
                .filter(|key| glob_match(pattern, key))
                .cloned()
                .collect();

            inner.next_cursor += 1;
            (inner.next_cursor, keys)
        } else {
            match inner.scans.remove(&cursor) {
                Some(pending) => (cursor, pending),
                None => return Ok((0, Vec::new())),
            }
        };

        let batch: Vec<_> = pending.drain(..count.max(1).min(pending.len())).collect();
        if pending.is_empty() {
            return Ok((0, batch));
        }

        inner.park_scan(cursor, pending);
        Ok((cursor, batch))
    }
}
