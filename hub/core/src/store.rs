//! Conversation Store
//!
//! Keyed, expiring storage of per-session conversations.
//!
//! # Expiry
//!
//! Every session carries a sliding idle window. Writes refresh it; reads do
//! not. An expired session is indistinguishable from one that never existed:
//! reads return an empty conversation and the next write starts over.
//! Expired entries are dropped lazily on access and in bulk by
//! [`ConversationStore::purge_expired`], which [`spawn_sweeper`] runs on an
//! interval. Without a sweeper, sessions that are never touched again stay
//! in memory.
//!
//! A session whose lock is held or awaited never expires, so a slow call
//! cannot lose the messages it is building on.
//!
//! # Per-session serialization
//!
//! The map is sharded, so sessions never contend with each other. Calls that
//! must not interleave on the same session take [`ConversationStore::lock_session`]
//! first; the guard is an owned async mutex guard, so it can be held across
//! the whole backend stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::messages::SessionId;
use crate::session::{ChatMessage, Conversation, Session, SystemSlot};

/// Default sliding expiration (30 minutes)
pub const DEFAULT_SLIDING_EXPIRATION: Duration = Duration::from_secs(30 * 60);

/// Errors raised by a conversation store
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No room for another session
    #[error("Conversation store is full ({capacity} sessions)")]
    ResourceExhausted {
        /// Configured session capacity
        capacity: usize,
    },
}

/// Store configuration
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Idle time after which a session is evicted
    pub sliding_expiration: Duration,
    /// Maximum number of live sessions (0 = unlimited)
    pub max_sessions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sliding_expiration: DEFAULT_SLIDING_EXPIRATION,
            max_sessions: 0,
        }
    }
}

impl StoreConfig {
    /// Set the sliding expiration
    #[must_use]
    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = window;
        self
    }

    /// Set the session capacity
    #[must_use]
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }
}

type LockMap = DashMap<SessionId, Arc<Mutex<()>>>;

/// Exclusive access to one session for the lifetime of the guard
///
/// Dropping the last guard for a session removes its lock entry.
#[derive(Debug)]
pub struct SessionGuard {
    session_id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl SessionGuard {
    /// The locked session
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or awaits it
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Storage contract used by the hub
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Read a conversation
    ///
    /// Never fails and never creates an entry. Missing or expired sessions
    /// read as empty.
    fn get(&self, id: &SessionId) -> Conversation;

    /// Append a message, creating the session on first write
    ///
    /// # Errors
    ///
    /// [`StoreError::ResourceExhausted`] if a new session cannot be allocated.
    fn append(&self, id: &SessionId, message: ChatMessage) -> Result<(), StoreError>;

    /// Write the system slot at index 0
    ///
    /// # Errors
    ///
    /// [`StoreError::ResourceExhausted`] if a new session cannot be allocated.
    fn upsert_system(&self, id: &SessionId, text: &str) -> Result<SystemSlot, StoreError>;

    /// Wait for exclusive access to a session
    async fn lock_session(&self, id: &SessionId) -> SessionGuard;

    /// Drop every expired session, returning how many were removed
    fn purge_expired(&self) -> usize;

    /// Number of sessions currently held (expired ones included until purged)
    fn session_count(&self) -> usize;
}

/// In-memory store backed by a sharded concurrent map
pub struct MemoryConversationStore {
    /// Live sessions
    sessions: DashMap<SessionId, Session>,
    /// Per-session call locks
    locks: Arc<LockMap>,
    /// Sessions counted against capacity
    live: AtomicUsize,
    /// Configuration
    config: StoreConfig,
}

impl Default for MemoryConversationStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl MemoryConversationStore {
    /// Create a store
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            locks: Arc::new(DashMap::new()),
            live: AtomicUsize::new(0),
            config,
        }
    }

    /// Create a store with the given idle window and no capacity limit
    #[must_use]
    pub fn with_sliding_expiration(window: Duration) -> Self {
        Self::new(StoreConfig::default().with_sliding_expiration(window))
    }

    /// The configured idle window
    #[must_use]
    pub fn sliding_expiration(&self) -> Duration {
        self.config.sliding_expiration
    }

    /// Whether a call holds or awaits the lock for `id`
    fn is_locked(&self, id: &SessionId) -> bool {
        self.locks
            .get(id)
            .is_some_and(|lock| Arc::strong_count(lock.value()) > 1)
    }

    /// Whether `session` may be dropped now
    fn can_evict(&self, id: &SessionId, session: &Session) -> bool {
        session.is_expired(self.config.sliding_expiration) && !self.is_locked(id)
    }

    /// Remove `id` if it has expired, returning whether it was removed
    fn evict_if_expired(&self, id: &SessionId) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |id, session| self.can_evict(id, session))
            .is_some();
        if removed {
            self.live.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(session_id = %id, "Session expired");
        }
        removed
    }

    /// Claim a capacity slot for a new session
    fn reserve_slot(&self) -> bool {
        let capacity = self.config.max_sessions;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (capacity == 0 || live < capacity).then_some(live + 1)
            })
            .is_ok()
    }

    /// Existing session for `id`, or a new one if a slot is free
    fn entry_with_capacity(&self, id: &SessionId) -> Option<RefMut<'_, SessionId, Session>> {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(entry) => Some(entry.into_ref()),
            Entry::Vacant(entry) => {
                if !self.reserve_slot() {
                    return None;
                }
                tracing::debug!(session_id = %id, "Session created");
                Some(entry.insert(Session::new(id.clone())))
            }
        }
    }

    /// Run `f` against a live session, creating it if needed, then touch it
    fn write<R>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> R) -> Result<R, StoreError> {
        self.evict_if_expired(id);

        let mut session = match self.entry_with_capacity(id) {
            Some(session) => session,
            None => {
                self.purge_expired();
                self.entry_with_capacity(id).ok_or_else(|| {
                    let capacity = self.config.max_sessions;
                    tracing::warn!(capacity = capacity, "Conversation store full, rejecting new session");
                    StoreError::ResourceExhausted { capacity }
                })?
            }
        };
        let result = f(session.value_mut());
        session.touch();
        Ok(result)
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    fn get(&self, id: &SessionId) -> Conversation {
        if self.evict_if_expired(id) {
            return Conversation::new();
        }
        self.sessions
            .get(id)
            .map(|session| session.conversation.clone())
            .unwrap_or_default()
    }

    fn append(&self, id: &SessionId, message: ChatMessage) -> Result<(), StoreError> {
        self.write(id, |session| session.conversation.push(message))
    }

    fn upsert_system(&self, id: &SessionId, text: &str) -> Result<SystemSlot, StoreError> {
        self.write(id, |session| session.conversation.upsert_system(text))
    }

    async fn lock_session(&self, id: &SessionId) -> SessionGuard {
        let lock = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        SessionGuard {
            session_id: id.clone(),
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(&self.locks),
        }
    }

    fn purge_expired(&self) -> usize {
        let mut removed = 0;
        self.sessions.retain(|id, session| {
            let evict = self.can_evict(id, session);
            removed += usize::from(evict);
            !evict
        });
        self.live.fetch_sub(removed, Ordering::SeqCst);

        // Locks nobody is holding or waiting on
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        if removed > 0 {
            tracing::debug!(removed = removed, remaining = self.sessions.len(), "Purged expired sessions");
        }
        removed
    }

    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Spawn a task that purges expired sessions every `every`
pub fn spawn_sweeper<S>(store: Arc<S>, every: Duration) -> JoinHandle<()>
where
    S: ConversationStore + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Role;

    fn sid(id: &str) -> SessionId {
        SessionId::new(id)
    }

    #[test]
    fn test_get_missing_session_is_empty_and_not_created() {
        let store = MemoryConversationStore::default();
        assert!(store.get(&sid("nobody")).is_empty());
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_append_creates_session() {
        let store = MemoryConversationStore::default();
        store.append(&sid("s1"), ChatMessage::user("hi")).unwrap();
        store.append(&sid("s1"), ChatMessage::assistant("hello")).unwrap();

        let conv = store.get(&sid("s1"));
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].role, Role::User);
        assert_eq!(conv.messages()[1].text, "hello");
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = MemoryConversationStore::default();
        store.append(&sid("a"), ChatMessage::user("for a")).unwrap();
        store.append(&sid("b"), ChatMessage::user("for b")).unwrap();

        assert_eq!(store.get(&sid("a")).messages()[0].text, "for a");
        assert_eq!(store.get(&sid("b")).messages()[0].text, "for b");
    }

    #[tokio::test]
    async fn test_upsert_system_through_store() {
        let store = MemoryConversationStore::default();
        assert_eq!(store.upsert_system(&sid("s"), "v1").unwrap(), SystemSlot::Inserted);
        store.append(&sid("s"), ChatMessage::user("q")).unwrap();
        assert_eq!(store.upsert_system(&sid("s"), "v1").unwrap(), SystemSlot::Unchanged);
        assert_eq!(store.upsert_system(&sid("s"), "v2").unwrap(), SystemSlot::Replaced);

        let conv = store.get(&sid("s"));
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.system_message(), Some("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_expires() {
        let store = MemoryConversationStore::with_sliding_expiration(Duration::from_secs(60));
        store.append(&sid("s1"), ChatMessage::user("hi")).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(store.get(&sid("s1")).is_empty());
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_extend_window_but_reads_do_not() {
        let store = MemoryConversationStore::with_sliding_expiration(Duration::from_secs(60));
        store.append(&sid("s1"), ChatMessage::user("one")).unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        store.append(&sid("s1"), ChatMessage::user("two")).unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.get(&sid("s1")).len(), 2);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(store.get(&sid("s1")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_after_expiry_starts_fresh() {
        let store = MemoryConversationStore::with_sliding_expiration(Duration::from_secs(10));
        store.append(&sid("s1"), ChatMessage::user("old")).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        store.append(&sid("s1"), ChatMessage::user("new")).unwrap();

        let conv = store.get(&sid("s1"));
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].text, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryConversationStore::with_sliding_expiration(Duration::from_secs(10));
        store.append(&sid("old"), ChatMessage::user("x")).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.append(&sid("fresh"), ChatMessage::user("y")).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.session_count(), 1);
        assert_eq!(store.get(&sid("fresh")).len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_exhausted() {
        let store = MemoryConversationStore::new(StoreConfig::default().with_max_sessions(2));
        store.append(&sid("a"), ChatMessage::user("1")).unwrap();
        store.append(&sid("b"), ChatMessage::user("2")).unwrap();

        let err = store.append(&sid("c"), ChatMessage::user("3")).unwrap_err();
        assert_eq!(err, StoreError::ResourceExhausted { capacity: 2 });

        // Existing sessions still accept writes
        store.append(&sid("a"), ChatMessage::user("more")).unwrap();
        assert_eq!(store.get(&sid("a")).len(), 2);
        assert!(store.get(&sid("c")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_reclaims_expired_sessions() {
        let store = MemoryConversationStore::new(
            StoreConfig::default()
                .with_max_sessions(1)
                .with_sliding_expiration(Duration::from_secs(5)),
        );
        store.append(&sid("a"), ChatMessage::user("1")).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        store.append(&sid("b"), ChatMessage::user("2")).unwrap();
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_session_serializes_same_session() {
        let store = Arc::new(MemoryConversationStore::default());
        let guard = store.lock_session(&sid("s1")).await;
        assert_eq!(guard.session_id(), &sid("s1"));

        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let _guard = store.lock_session(&sid("s1")).await;
            })
        };

        // Another session is not blocked
        let _other = store.lock_session(&sid("s2")).await;

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_session_does_not_expire() {
        let store = MemoryConversationStore::with_sliding_expiration(Duration::from_secs(60));
        let guard = store.lock_session(&sid("s1")).await;
        store.upsert_system(&sid("s1"), "sys").unwrap();
        store.append(&sid("s1"), ChatMessage::user("hi")).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.purge_expired(), 0);
        store.append(&sid("s1"), ChatMessage::assistant("late")).unwrap();

        let roles: Vec<_> = store.get(&sid("s1")).messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);

        drop(guard);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_lock_entry_removed_with_last_guard() {
        let store = Arc::new(MemoryConversationStore::default());
        let guard = store.lock_session(&sid("s1")).await;

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let _guard = store.lock_session(&sid("s1")).await;
            })
        };
        tokio::task::yield_now().await;

        drop(guard);
        assert_eq!(store.locks.len(), 1);

        waiter.await.unwrap();
        assert_eq!(store.locks.len(), 0);
    }

    #[test]
    fn test_capacity_holds_under_concurrent_creates() {
        let store = MemoryConversationStore::new(StoreConfig::default().with_max_sessions(4));

        let created = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = &store;
                    scope.spawn(move || {
                        store
                            .append(&sid(&format!("s{i}")), ChatMessage::user("hi"))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });

        assert_eq!(created, 4);
        assert_eq!(store.session_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_on_interval() {
        let store = Arc::new(MemoryConversationStore::with_sliding_expiration(
            Duration::from_secs(5),
        ));
        store.append(&sid("s1"), ChatMessage::user("x")).unwrap();

        let sweeper = spawn_sweeper(Arc::clone(&store), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(store.session_count(), 0);
        sweeper.abort();
    }
}
