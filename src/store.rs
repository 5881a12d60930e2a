//! Store interfaces consumed by the tutoring core, plus in-memory backends.
//!
//! - `ContentStore`: immutable problem items.
//! - `ProfileStore`: durable learner records. Writes are whole-record `put_*`
//!   calls, so retrying one after a lost acknowledgement is harmless. Callers
//!   serialize read-compute-put per learner (see `LearnerLocks`).
//! - `SessionStore`: session records, owned by the session engine.
//!
//! The in-memory backends keep everything behind `tokio::sync::RwLock`s and
//! are what the service runs with by default; durable backends implement the
//! same traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::domain::{Item, LearnerProfile, MasteryRecord, MisconceptionRecord, Session};
use crate::error::StoreError;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_item(&self, item_id: &str) -> Result<Option<Arc<Item>>, StoreError>;
    async fn list_items(&self) -> Result<Vec<Arc<Item>>, StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_mastery(&self, learner_id: &str, skill: &str) -> Result<Option<MasteryRecord>, StoreError>;
    async fn list_mastery(&self, learner_id: &str) -> Result<Vec<MasteryRecord>, StoreError>;
    async fn put_mastery(&self, learner_id: &str, record: MasteryRecord) -> Result<(), StoreError>;

    async fn get_misconception(&self, learner_id: &str, tag: &str) -> Result<Option<MisconceptionRecord>, StoreError>;
    async fn get_misconceptions(&self, learner_id: &str) -> Result<Vec<MisconceptionRecord>, StoreError>;
    async fn put_misconception(&self, learner_id: &str, record: MisconceptionRecord) -> Result<(), StoreError>;

    /// Missing profiles read as a fresh, zeroed profile.
    async fn get_profile(&self, learner_id: &str) -> Result<LearnerProfile, StoreError>;
    async fn put_profile(&self, profile: LearnerProfile) -> Result<(), StoreError>;
}

/// One async mutex per learner. Held across a read-compute-put so parallel
/// sessions of the same learner never overwrite each other's records.
#[derive(Clone, Default)]
pub struct LearnerLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LearnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, learner_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            map.entry(learner_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session) -> Result<(), StoreError>;
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
    /// Replace an existing session.
    async fn put(&self, session: Session) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory content
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryContentStore {
    by_id: HashMap<String, Arc<Item>>,
    /// Load order, for stable listing.
    order: Vec<String>,
}

impl InMemoryContentStore {
    /// Later duplicates of an id are ignored.
    pub fn new(items: Vec<Item>) -> Self {
        let mut store = Self::default();
        for item in items {
            if store.by_id.contains_key(&item.id) {
                continue;
            }
            store.order.push(item.id.clone());
            store.by_id.insert(item.id.clone(), Arc::new(item));
        }
        store
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn get_item(&self, item_id: &str) -> Result<Option<Arc<Item>>, StoreError> {
        Ok(self.by_id.get(item_id).cloned())
    }

    async fn list_items(&self) -> Result<Vec<Arc<Item>>, StoreError> {
        Ok(self.order.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory profiles
// ---------------------------------------------------------------------------

type LearnerKey = (String, String);

#[derive(Default)]
pub struct InMemoryProfileStore {
    mastery: RwLock<HashMap<LearnerKey, MasteryRecord>>,
    misconceptions: RwLock<HashMap<LearnerKey, MisconceptionRecord>>,
    profiles: RwLock<HashMap<String, LearnerProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(learner_id: &str, k: &str) -> LearnerKey {
    (learner_id.to_string(), k.to_string())
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_mastery(&self, learner_id: &str, skill: &str) -> Result<Option<MasteryRecord>, StoreError> {
        Ok(self.mastery.read().await.get(&key(learner_id, skill)).cloned())
    }

    async fn list_mastery(&self, learner_id: &str) -> Result<Vec<MasteryRecord>, StoreError> {
        let map = self.mastery.read().await;
        let mut out: Vec<MasteryRecord> =
            map.iter().filter(|((l, _), _)| l == learner_id).map(|(_, r)| r.clone()).collect();
        out.sort_by(|a, b| a.skill.cmp(&b.skill));
        Ok(out)
    }

    async fn put_mastery(&self, learner_id: &str, record: MasteryRecord) -> Result<(), StoreError> {
        self.mastery.write().await.insert(key(learner_id, &record.skill), record);
        Ok(())
    }

    async fn get_misconception(&self, learner_id: &str, tag: &str) -> Result<Option<MisconceptionRecord>, StoreError> {
        Ok(self.misconceptions.read().await.get(&key(learner_id, tag)).cloned())
    }

    async fn get_misconceptions(&self, learner_id: &str) -> Result<Vec<MisconceptionRecord>, StoreError> {
        let map = self.misconceptions.read().await;
        let mut out: Vec<MisconceptionRecord> =
            map.iter().filter(|((l, _), _)| l == learner_id).map(|(_, r)| r.clone()).collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        Ok(out)
    }

    async fn put_misconception(&self, learner_id: &str, record: MisconceptionRecord) -> Result<(), StoreError> {
        self.misconceptions.write().await.insert(key(learner_id, &record.tag), record);
        Ok(())
    }

    async fn get_profile(&self, learner_id: &str) -> Result<LearnerProfile, StoreError> {
        Ok(self
            .profiles
            .read()
            .await
            .get(learner_id)
            .cloned()
            .unwrap_or_else(|| LearnerProfile::new(learner_id)))
    }

    async fn put_profile(&self, profile: LearnerProfile) -> Result<(), StoreError> {
        self.profiles.write().await.insert(profile.learner_id.clone(), profile);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory sessions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut map = self.sessions.write().await;
        if map.contains_key(&session.session_id) {
            return Err(StoreError::Rejected(format!("session {} already exists", session.session_id)));
        }
        debug!(target: "session", session_id = %session.session_id, "Session stored");
        map.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn put(&self, session: Session) -> Result<(), StoreError> {
        let mut map = self.sessions.write().await;
        match map.get_mut(&session.session_id) {
            Some(slot) => {
                *slot = session;
                Ok(())
            }
            None => Err(StoreError::Rejected(format!("session {} does not exist", session.session_id))),
        }
    }
}
