//! Conversation state persistence
//!
//! Every thread is an append-only message log. Writers must hold the
//! thread's [`ThreadLease`], so mutation of one thread is serialized while
//! other threads proceed independently. Each append is a checkpoint: a
//! request that dies part-way resumes from the last successful append.

use crate::error::OrchestrationError;
use crate::models::{ConversationState, Message, UserContext};
use crate::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub mod postgres;
pub use postgres::PostgresConversationBackend;

/// Storage behind the conversation store
#[async_trait::async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>>;

    /// Store a brand-new thread; a thread that already exists is left untouched
    async fn create(&self, state: &ConversationState) -> Result<()>;

    /// Append all messages or none, returning the updated state
    async fn append(&self, thread_id: &str, messages: &[Message]) -> Result<ConversationState>;

    async fn active_thread(&self, base_thread_id: &str) -> Result<Option<String>>;

    async fn set_active_thread(&self, base_thread_id: &str, thread_id: &str) -> Result<()>;
}

//
// ================= Thread Identity =================
//

/// Deterministic thread id for a user: `user_` + 16 hex chars of SHA-256
pub fn base_thread_id(user_identifier: &str) -> String {
    let normalized = user_identifier.trim().to_lowercase();
    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
    format!("user_{}", &digest[..16])
}

/// Unique thread id with a time component, for "new thread" requests
pub fn fresh_thread_id(user_identifier: &str) -> String {
    format!(
        "{}-{}-{}",
        base_thread_id(user_identifier),
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

//
// ================= Store Facade =================
//

/// Exclusive write access to one thread, released on drop
pub struct ThreadLease {
    thread_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl ThreadLease {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

pub struct ConversationStore {
    backend: Arc<dyn ConversationBackend>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn ConversationBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryConversationBackend::new()))
    }

    /// Wait for, then take, the thread's write lock
    pub async fn lease(&self, thread_id: &str) -> ThreadLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop locks nobody is holding or waiting on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        ThreadLease {
            thread_id: thread_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Load the leased thread, creating it on first contact
    pub async fn get_or_create(
        &self,
        lease: &ThreadLease,
        user_context: UserContext,
    ) -> Result<ConversationState> {
        if let Some(mut state) = self.backend.load(lease.thread_id()).await? {
            state.user_context = user_context;
            return Ok(state);
        }

        let state = ConversationState::new(lease.thread_id(), user_context);
        self.backend.create(&state).await?;
        info!(thread_id = %lease.thread_id(), "Conversation thread created");
        Ok(state)
    }

    /// Atomically append to the leased thread and return the new state
    pub async fn append(
        &self,
        lease: &ThreadLease,
        messages: Vec<Message>,
    ) -> Result<ConversationState> {
        let state = self.backend.append(lease.thread_id(), &messages).await?;
        debug!(
            thread_id = %lease.thread_id(),
            appended = messages.len(),
            total = state.messages.len(),
            "Conversation checkpoint"
        );
        Ok(state)
    }

    /// Read-only snapshot of a thread
    pub async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        self.backend.load(thread_id).await
    }

    /// Thread a request should run on.
    ///
    /// "Continue" requests reuse the user's active thread (the deterministic
    /// base id until a new thread is started). "New thread" requests get a
    /// fresh id, which becomes the active one; the old thread is kept.
    pub async fn resolve_thread(&self, user_identifier: &str, new_thread: bool) -> Result<String> {
        let base = base_thread_id(user_identifier);

        if new_thread {
            let thread_id = fresh_thread_id(user_identifier);
            self.backend.set_active_thread(&base, &thread_id).await?;
            info!(thread_id = %thread_id, "Started new conversation thread");
            return Ok(thread_id);
        }

        Ok(self.backend.active_thread(&base).await?.unwrap_or(base))
    }
}

//
// ================= In-Memory Backend =================
//

/// In-memory conversation backend for development
pub struct InMemoryConversationBackend {
    threads: RwLock<HashMap<String, ConversationState>>,
    active: RwLock<HashMap<String, String>>,
}

impl InMemoryConversationBackend {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryConversationBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConversationBackend for InMemoryConversationBackend {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).cloned())
    }

    async fn create(&self, state: &ConversationState) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads
            .entry(state.thread_id.clone())
            .or_insert_with(|| state.clone());
        Ok(())
    }

    async fn append(&self, thread_id: &str, messages: &[Message]) -> Result<ConversationState> {
        let mut threads = self.threads.write().await;
        let state = threads.get_mut(thread_id).ok_or_else(|| {
            OrchestrationError::StateError(format!("Unknown thread: {}", thread_id))
        })?;
        state.messages.extend_from_slice(messages);
        Ok(state.clone())
    }

    async fn active_thread(&self, base_thread_id: &str) -> Result<Option<String>> {
        let active = self.active.read().await;
        Ok(active.get(base_thread_id).cloned())
    }

    async fn set_active_thread(&self, base_thread_id: &str, thread_id: &str) -> Result<()> {
        let mut active = self.active.write().await;
        active.insert(base_thread_id.to_string(), thread_id.to_string());
        Ok(())
    }
}
