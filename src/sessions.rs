//! Process-wide, memory-resident session store.
//!
//! Maps each [`UserId`] to a bounded conversation transcript and at most
//! one [`PendingArchive`]. Nothing is persisted; a restart loses every
//! session.
//!
//! # Eviction
//!
//! - Transcripts keep the most recent `max_turns` entries, oldest dropped
//!   first.
//! - Entries idle longer than `idle_ttl` are purged lazily on access and by
//!   [`SessionStore::purge_expired`].
//! - When a new user arrives at `max_users`, the least recently touched
//!   entry is evicted.
//!
//! Evicting or clearing a session, or replacing its archive, releases the
//! archive's working directory. The directory itself is deleted once the
//! last [`PendingArchive`] handle is dropped, so a sync that is still
//! reading the old tree keeps it alive until it finishes.
//!
//! Released archives are never dropped while the store lock is held.
//! Inside a Tokio runtime the removal runs on the blocking pool.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::config::SessionsConfig;
use crate::models::{ConversationTurn, UserId};

/// A user's extracted upload awaiting synchronization.
///
/// Cloning shares ownership of the directory; it is removed from disk
/// when the last clone is dropped.
#[derive(Clone)]
pub struct PendingArchive {
    dir: Arc<TempDir>,
}

impl PendingArchive {
    pub fn new(dir: TempDir) -> Self {
        Self { dir: Arc::new(dir) }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Drops this handle. If it was the last one the directory is removed,
    /// on the blocking pool when called from inside a Tokio runtime.
    pub fn release(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || drop(self));
            }
            Err(_) => drop(self),
        }
    }
}

impl fmt::Debug for PendingArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PendingArchive").field(&self.path()).finish()
    }
}

struct SessionEntry {
    transcript: VecDeque<ConversationTurn>,
    pending: Option<PendingArchive>,
    last_touched: Instant,
}

impl SessionEntry {
    fn new(now: Instant) -> Self {
        Self {
            transcript: VecDeque::new(),
            pending: None,
            last_touched: now,
        }
    }
}

pub struct SessionStore {
    entries: Mutex<HashMap<UserId, SessionEntry>>,
    max_turns: usize,
    max_users: usize,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_turns: config.max_turns.max(1),
            max_users: config.max_users.max(1),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
        }
    }

    /// Transcript for `user`, oldest first. Empty for unknown users.
    pub fn get(&self, user: &UserId) -> Vec<ConversationTurn> {
        let (transcript, expired) = {
            let mut entries = self.lock();
            let now = Instant::now();
            let expired = self.take_expired(&mut entries, user, now);
            let transcript = entries
                .get_mut(user)
                .map(|entry| {
                    entry.last_touched = now;
                    entry.transcript.iter().cloned().collect::<Vec<_>>()
                })
                .unwrap_or_default();
            (transcript, expired)
        };
        release(expired);
        transcript
    }

    /// Appends `turn`, dropping the oldest turns beyond `max_turns`.
    pub fn append(&self, user: &UserId, turn: ConversationTurn) {
        let evicted = {
            let mut entries = self.lock();
            let (entry, evicted) = self.entry_mut(&mut entries, user);
            push_bounded(&mut entry.transcript, turn, self.max_turns);
            evicted
        };
        release(evicted);
    }

    /// Appends a user message and the assistant's reply as one update.
    pub fn record_exchange(&self, user: &UserId, user_text: &str, reply: &str) {
        let evicted = {
            let mut entries = self.lock();
            let (entry, evicted) = self.entry_mut(&mut entries, user);
            push_bounded(
                &mut entry.transcript,
                ConversationTurn::user(user_text),
                self.max_turns,
            );
            push_bounded(
                &mut entry.transcript,
                ConversationTurn::assistant(reply),
                self.max_turns,
            );
            evicted
        };
        release(evicted);
    }

    /// Forgets the transcript and pending archive of `user`.
    /// Returns whether a session existed.
    pub fn clear(&self, user: &UserId) -> bool {
        let removed = self.lock().remove(user);
        let existed = removed.is_some();
        release(removed);
        existed
    }

    /// Registers `archive` for `user`, releasing any previous one.
    pub fn set_pending_archive(&self, user: &UserId, archive: PendingArchive) {
        let (previous, evicted) = {
            let mut entries = self.lock();
            let (entry, evicted) = self.entry_mut(&mut entries, user);
            (entry.pending.replace(archive), evicted)
        };
        if let Some(previous) = &previous {
            tracing::debug!(
                user = %user,
                dir = %previous.path().display(),
                "superseding pending archive"
            );
        }
        if let Some(previous) = previous {
            previous.release();
        }
        release(evicted);
    }

    pub fn pending_archive(&self, user: &UserId) -> Option<PendingArchive> {
        let (pending, expired) = {
            let mut entries = self.lock();
            let now = Instant::now();
            let expired = self.take_expired(&mut entries, user, now);
            let pending = entries.get_mut(user).and_then(|entry| {
                entry.last_touched = now;
                entry.pending.clone()
            });
            (pending, expired)
        };
        release(expired);
        pending
    }

    /// Drops every entry idle past the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<SessionEntry> = {
            let mut entries = self.lock();
            let keys: Vec<UserId> = entries
                .iter()
                .filter(|(_, e)| self.is_expired(e, now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let purged = expired.len();
        release(expired);
        purged
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, SessionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &SessionEntry, now: Instant) -> bool {
        now.duration_since(entry.last_touched) >= self.idle_ttl
    }

    /// Removes the entry of `user` if it has expired and hands it back so
    /// the caller can release it after unlocking.
    fn take_expired(
        &self,
        entries: &mut HashMap<UserId, SessionEntry>,
        user: &UserId,
        now: Instant,
    ) -> Option<SessionEntry> {
        if entries.get(user).is_some_and(|e| self.is_expired(e, now)) {
            entries.remove(user)
        } else {
            None
        }
    }

    /// Returns the entry for `user`, creating it if needed. When a new
    /// entry would exceed `max_users` the least recently touched one is
    /// evicted and handed back so the caller can drop it after unlocking.
    fn entry_mut<'a>(
        &self,
        entries: &'a mut HashMap<UserId, SessionEntry>,
        user: &UserId,
    ) -> (&'a mut SessionEntry, Option<SessionEntry>) {
        let now = Instant::now();
        let mut evicted = None;

        if entries.get(user).is_some_and(|e| self.is_expired(e, now)) {
            evicted = entries.remove(user);
        }

        if !entries.contains_key(user) && entries.len() >= self.max_users {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_touched)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                tracing::debug!(user = %key, "session capacity reached, evicting");
                evicted = entries.remove(&key);
            }
        }

        let entry = entries
            .entry(user.clone())
            .or_insert_with(|| SessionEntry::new(now));
        entry.last_touched = now;
        (entry, evicted)
    }
}

/// Releases the pending archives of entries removed from the map.
fn release(entries: impl IntoIterator<Item = SessionEntry>) {
    for archive in entries.into_iter().filter_map(|entry| entry.pending) {
        archive.release();
    }
}

fn push_bounded(transcript: &mut VecDeque<ConversationTurn>, turn: ConversationTurn, cap: usize) {
    transcript.push_back(turn);
    while transcript.len() > cap {
        transcript.pop_front();
    }
}
