//! In-process conversation state.
//!
//! Neither map survives a restart. Entries expire after a TTL of inactivity
//! and the oldest entry is evicted once `max_keys` is reached.

use crate::channels::QuickReply;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const SESSION_TTL_SECS: u64 = 60 * 60 * 24;
pub const SESSION_MAX_KEYS_DEFAULT: usize = 10_000;

#[derive(Debug)]
struct TtlMap<V> {
    ttl: Duration,
    max_keys: usize,
    entries: Mutex<HashMap<i64, (V, Instant)>>,
}

impl<V: Clone> TtlMap<V> {
    fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            ttl,
            max_keys: max_keys.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_insert_with(&self, key: i64, make: impl FnOnce() -> V) -> (V, bool) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, touched)| now.duration_since(*touched) < self.ttl);

        if let Some((value, touched)) = entries.get_mut(&key) {
            *touched = now;
            return (value.clone(), false);
        }

        Self::evict_oldest(&mut entries, self.max_keys);
        let value = make();
        entries.insert(key, (value.clone(), now));
        (value, true)
    }

    fn get(&self, key: i64) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some((value, touched)) if now.duration_since(*touched) < self.ttl => {
                *touched = now;
                Some(value.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: i64, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, touched)| now.duration_since(*touched) < self.ttl);
        if !entries.contains_key(&key) {
            Self::evict_oldest(&mut entries, self.max_keys);
        }
        entries.insert(key, (value, now));
    }

    fn remove(&self, key: i64) -> Option<V> {
        self.entries.lock().remove(&key).map(|(value, _)| value)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn evict_oldest(entries: &mut HashMap<i64, (V, Instant)>, max_keys: usize) {
        if entries.len() < max_keys {
            return;
        }
        let oldest = entries
            .iter()
            .min_by_key(|(_, (_, touched))| *touched)
            .map(|(k, _)| *k);
        if let Some(oldest) = oldest {
            entries.remove(&oldest);
        }
    }
}

/// Client id to NLU session id.
#[derive(Debug)]
pub struct SessionStore {
    sessions: TtlMap<String>,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            sessions: TtlMap::new(ttl, max_keys),
        }
    }

    /// Returns the session id and whether it was created by this call.
    pub fn get_or_create(&self, client_id: i64) -> (String, bool) {
        self.sessions
            .get_or_insert_with(client_id, || uuid::Uuid::new_v4().to_string())
    }

    pub fn get(&self, client_id: i64) -> Option<String> {
        self.sessions.get(client_id)
    }

    pub fn end(&self, client_id: i64) -> Option<String> {
        self.sessions.remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(SESSION_TTL_SECS),
            SESSION_MAX_KEYS_DEFAULT,
        )
    }
}

/// Client id to the recipe ids last offered to them, so a follow-up
/// "nummer 2" can be resolved.
#[derive(Debug)]
pub struct RecipeSelections {
    offered: TtlMap<Vec<i64>>,
}

impl RecipeSelections {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            offered: TtlMap::new(ttl, max_keys),
        }
    }

    pub fn offer(&self, client_id: i64, recipe_ids: Vec<i64>) {
        self.offered.insert(client_id, recipe_ids);
    }

    /// Resolve a 1-based choice against the last offer.
    pub fn choose(&self, client_id: i64, choice: usize) -> Option<i64> {
        let offered = self.offered.get(client_id)?;
        offered.get(choice.checked_sub(1)?).copied()
    }

    pub fn clear(&self, client_id: i64) {
        self.offered.remove(client_id);
    }
}

impl Default for RecipeSelections {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(SESSION_TTL_SECS),
            SESSION_MAX_KEYS_DEFAULT,
        )
    }
}

/// Client id to the quick replies last shown. Alterdesk clients answer with
/// the option number, which is resolved against this.
#[derive(Debug)]
pub struct OfferedReplies {
    offered: TtlMap<Vec<QuickReply>>,
}

impl OfferedReplies {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            offered: TtlMap::new(ttl, max_keys),
        }
    }

    pub fn offer(&self, client_id: i64, replies: Vec<QuickReply>) {
        if replies.is_empty() {
            self.offered.remove(client_id);
        } else {
            self.offered.insert(client_id, replies);
        }
    }

    pub fn last(&self, client_id: i64) -> Vec<QuickReply> {
        self.offered.get(client_id).unwrap_or_default()
    }
}

impl Default for OfferedReplies {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(SESSION_TTL_SECS),
            SESSION_MAX_KEYS_DEFAULT,
        )
    }
}
