//! Per-user session store and activity tracker.

use crate::error::{MemoryError, MemoryResult};
use crate::turn::Turn;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use kanade_common::config::MemoryConfig;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

// ============================================================================
// Conversation
// ============================================================================

/// A user's conversation: priming turns followed by recent exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    priming: Vec<Turn>,
    turns: VecDeque<Turn>,
}

impl Conversation {
    /// Start a conversation from its priming turns.
    pub fn new(priming: Vec<Turn>) -> Self {
        Self {
            priming,
            turns: VecDeque::new(),
        }
    }

    pub fn priming(&self) -> &[Turn] {
        &self.priming
    }

    /// Exchange turns, oldest first. Priming turns are not included.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Number of exchange turns (excluding priming).
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Total turns including priming.
    pub fn len(&self) -> usize {
        self.priming.len() + self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full history: priming turns followed by exchange turns.
    pub fn history(&self) -> Vec<Turn> {
        self.priming.iter().chain(self.turns.iter()).cloned().collect()
    }

    /// History plus one pending request turn, ready to send to the model.
    pub fn contents_with(&self, request: &Turn) -> Vec<Turn> {
        let mut contents = self.history();
        contents.push(request.clone());
        contents
    }

    /// Append one exchange and drop the oldest exchange turns beyond
    /// `2 * max_exchanges`. Priming turns never count toward the cap.
    pub fn push_exchange(&mut self, request: Turn, response: Turn, max_exchanges: usize) {
        self.turns.push_back(request);
        self.turns.push_back(response);

        let cap = max_exchanges.saturating_mul(2);
        while self.turns.len() > cap {
            self.turns.pop_front();
        }
    }
}

// ============================================================================
// User records
// ============================================================================

/// Lock-protected part of a user record.
#[derive(Debug, Default)]
struct UserState {
    conversation: Option<Conversation>,
    /// Set once the record has been removed from the store. Callers that were
    /// waiting on the lock must retry against a fresh record.
    evicted: bool,
}

/// One user's record.
///
/// Activity counters are atomics so readers (staleness checks, stats) never
/// wait on an exchange that holds the lock across a model call. They are only
/// written while the lock is held.
#[derive(Debug)]
struct UserSlot {
    /// Creation order, used to break leaderboard ties.
    seq: u64,
    last_seen_ms: AtomicI64,
    message_count: AtomicU64,
    state: Arc<Mutex<UserState>>,
}

impl UserSlot {
    fn new(seq: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            seq,
            last_seen_ms: AtomicI64::new(created_at.timestamp_millis()),
            message_count: AtomicU64::new(0),
            state: Arc::new(Mutex::new(UserState::default())),
        }
    }

    fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::SeqCst)
    }

    fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.timestamp_millis() - self.last_seen_ms() > threshold.num_milliseconds()
    }
}

/// Aggregate activity numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub active_users: usize,
    pub total_messages: u64,
    /// `total_messages / active_users`, 0 when nobody is tracked.
    pub average: u64,
}

// ============================================================================
// UserEntry
// ============================================================================

/// Exclusive access to one user's record.
///
/// Dropping the entry releases the user.
pub struct UserEntry {
    user_id: String,
    slot: Arc<UserSlot>,
    state: OwnedMutexGuard<UserState>,
    max_history: usize,
}

impl UserEntry {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Record an inbound message at `now` and return the new message count.
    ///
    /// The first message replaces the creation timestamp; after that
    /// `last_seen_at` never moves backwards.
    pub fn record_activity(&mut self, now: DateTime<Utc>) -> u64 {
        let now_ms = now.timestamp_millis();
        if self.slot.message_count() == 0 {
            self.slot.last_seen_ms.store(now_ms, Ordering::SeqCst);
        } else {
            self.slot.last_seen_ms.fetch_max(now_ms, Ordering::SeqCst);
        }
        self.slot.message_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn message_count(&self) -> u64 {
        self.slot.message_count()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.state.conversation.as_ref()
    }

    /// Return the live conversation, creating it from `seed` if absent.
    pub fn ensure_conversation<F, E>(&mut self, seed: F) -> MemoryResult<&Conversation>
    where
        F: FnOnce() -> Result<Vec<Turn>, E>,
        E: Display,
    {
        if self.state.conversation.is_none() {
            let priming = seed().map_err(|e| MemoryError::SessionCreation {
                user_id: self.user_id.clone(),
                reason: e.to_string(),
            })?;
            tracing::debug!(user_id = %self.user_id, priming = priming.len(), "Session created");
            self.state.conversation = Some(Conversation::new(priming));
        }

        self.state
            .conversation
            .as_ref()
            .ok_or_else(|| MemoryError::NoSession(self.user_id.clone()))
    }

    /// Append a request/response pair and enforce the history cap.
    pub fn append_exchange(&mut self, request: Turn, response: Turn) -> MemoryResult<()> {
        let max_history = self.max_history;
        let conversation = self
            .state
            .conversation
            .as_mut()
            .ok_or_else(|| MemoryError::NoSession(self.user_id.clone()))?;
        conversation.push_exchange(request, response, max_history);
        Ok(())
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// Owns every user's conversation and activity record.
pub struct MemoryStore {
    users: DashMap<String, Arc<UserSlot>>,
    next_seq: AtomicU64,
    max_history: usize,
}

impl MemoryStore {
    /// Create an empty store keeping `max_history` exchanges per user.
    pub fn new(max_history: usize) -> Self {
        Self {
            users: DashMap::new(),
            next_seq: AtomicU64::new(0),
            max_history,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.max_history)
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    fn existing_slot(&self, user_id: &str) -> Option<Arc<UserSlot>> {
        self.users.get(user_id).map(|slot| Arc::clone(slot.value()))
    }

    fn slot_or_insert(&self, user_id: &str) -> Arc<UserSlot> {
        let slot = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                Arc::new(UserSlot::new(seq, Utc::now()))
            });
        Arc::clone(slot.value())
    }

    /// Lock the user's record, creating an empty one if absent.
    ///
    /// Waits while another exchange or the sweeper holds the user.
    pub async fn entry(&self, user_id: &str) -> UserEntry {
        loop {
            let slot = self.slot_or_insert(user_id);
            let state = Arc::clone(&slot.state).lock_owned().await;
            if state.evicted {
                // Evicted while we waited; the next pass inserts a fresh record.
                continue;
            }
            return UserEntry {
                user_id: user_id.to_string(),
                slot,
                state,
                max_history: self.max_history,
            };
        }
    }

    /// Record an inbound message for `user_id` at `now`.
    ///
    /// Creates the record with a count of 1 if absent and returns the new count.
    pub async fn record_activity(&self, user_id: &str, now: DateTime<Utc>) -> u64 {
        self.entry(user_id).await.record_activity(now)
    }

    /// Lock the user and make sure they have a session.
    ///
    /// A new session is seeded with the turns returned by `seed`. If `seed`
    /// fails nothing is stored and the error is returned.
    pub async fn get_or_create<F, E>(&self, user_id: &str, seed: F) -> MemoryResult<UserEntry>
    where
        F: FnOnce() -> Result<Vec<Turn>, E>,
        E: Display,
    {
        let mut entry = self.entry(user_id).await;
        let created = entry.ensure_conversation(seed).map(|_| ());
        if let Err(e) = created {
            if entry.message_count() == 0 {
                // Nothing worth keeping: drop the placeholder record.
                let UserEntry { slot, mut state, .. } = entry;
                self.detach(user_id, &slot, &mut state);
            }
            return Err(e);
        }
        Ok(entry)
    }

    /// Append an exchange to an existing session.
    pub async fn append_exchange(
        &self,
        user_id: &str,
        request: Turn,
        response: Turn,
    ) -> MemoryResult<()> {
        let Some(slot) = self.existing_slot(user_id) else {
            return Err(MemoryError::NoSession(user_id.to_string()));
        };
        let mut state = slot.state.lock().await;
        if state.evicted {
            return Err(MemoryError::NoSession(user_id.to_string()));
        }
        let conversation = state
            .conversation
            .as_mut()
            .ok_or_else(|| MemoryError::NoSession(user_id.to_string()))?;
        conversation.push_exchange(request, response, self.max_history);
        Ok(())
    }

    /// Snapshot of the user's history, priming turns included.
    pub async fn history(&self, user_id: &str) -> Option<Vec<Turn>> {
        let slot = self.existing_slot(user_id)?;
        let state = slot.state.lock().await;
        if state.evicted {
            return None;
        }
        state.conversation.as_ref().map(Conversation::history)
    }

    /// Remove the user's session and activity. Idempotent.
    ///
    /// Returns whether a record was removed.
    pub async fn evict(&self, user_id: &str) -> bool {
        let Some(slot) = self.existing_slot(user_id) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        self.detach(user_id, &slot, &mut state)
    }

    /// Admin reset; same effect as [`evict`](Self::evict) but waits at most
    /// `lock_wait` for a user who is mid-exchange.
    pub async fn reset(&self, user_id: &str, lock_wait: std::time::Duration) -> MemoryResult<bool> {
        let Some(slot) = self.existing_slot(user_id) else {
            return Ok(false);
        };
        let mut state = Self::lock_within(user_id, &slot, lock_wait).await?;
        Ok(self.detach(user_id, &slot, &mut state))
    }

    /// Activity removal; same effect as [`evict`](Self::evict).
    pub async fn remove(&self, user_id: &str) -> bool {
        self.evict(user_id).await
    }

    /// Evict the user if stale at `now`, waiting at most `lock_wait` for them.
    ///
    /// Staleness is re-checked under the lock so activity that arrived while
    /// waiting keeps the user.
    pub async fn evict_if_stale(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        threshold: Duration,
        lock_wait: std::time::Duration,
    ) -> MemoryResult<bool> {
        let Some(slot) = self.existing_slot(user_id) else {
            return Ok(false);
        };
        if !slot.is_stale(now, threshold) {
            return Ok(false);
        }

        let mut state = Self::lock_within(user_id, &slot, lock_wait).await?;

        if !slot.is_stale(now, threshold) {
            return Ok(false);
        }
        Ok(self.detach(user_id, &slot, &mut state))
    }

    async fn lock_within<'a>(
        user_id: &str,
        slot: &'a UserSlot,
        lock_wait: std::time::Duration,
    ) -> MemoryResult<tokio::sync::MutexGuard<'a, UserState>> {
        tokio::time::timeout(lock_wait, slot.state.lock())
            .await
            .map_err(|_| MemoryError::LockTimeout {
                user_id: user_id.to_string(),
                waited_ms: lock_wait.as_millis() as u64,
            })
    }

    /// Mark the record evicted and drop it from the map, if the map still
    /// points at this record. Caller must hold the record's lock.
    fn detach(&self, user_id: &str, slot: &Arc<UserSlot>, state: &mut UserState) -> bool {
        if state.evicted {
            return false;
        }
        state.evicted = true;
        state.conversation = None;
        self.users
            .remove_if(user_id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    /// True iff the user is tracked and `now - last_seen_at > threshold`.
    pub fn is_stale(&self, user_id: &str, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.existing_slot(user_id)
            .is_some_and(|slot| slot.is_stale(now, threshold))
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn message_count(&self, user_id: &str) -> Option<u64> {
        self.existing_slot(user_id).map(|slot| slot.message_count())
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        let ms = self.existing_slot(user_id)?.last_seen_ms();
        Utc.timestamp_millis_opt(ms).single()
    }

    /// Ids of every tracked user.
    pub fn user_ids(&self) -> Vec<String> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// The `n` users with the most messages, highest first.
    ///
    /// Equal counts keep first-activity order.
    pub fn top_n(&self, n: usize) -> Vec<(String, u64)> {
        let mut rows: Vec<(u64, String, u64)> = self
            .users
            .iter()
            .map(|e| (e.value().seq, e.key().clone(), e.value().message_count()))
            .collect();

        rows.sort_by_key(|(seq, _, _)| *seq);
        rows.sort_by(|a, b| b.2.cmp(&a.2));

        rows.into_iter()
            .take(n)
            .map(|(_, user_id, count)| (user_id, count))
            .collect()
    }

    pub fn total_messages(&self) -> u64 {
        self.users.iter().map(|e| e.value().message_count()).sum()
    }

    pub fn active_user_count(&self) -> usize {
        self.users.len()
    }

    pub fn stats(&self) -> StoreStats {
        let active_users = self.active_user_count();
        let total_messages = self.total_messages();
        let average = if active_users == 0 {
            0
        } else {
            total_messages / active_users as u64
        };
        StoreStats {
            active_users,
            total_messages,
            average,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}
