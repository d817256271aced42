//! In-process collaborator implementations
//!
//! Suitable for a single engine instance (the console host, tests). They
//! honor expirations using Tokio's clock, so paused-time tests work.

use super::traits::{
    ContactDirectory, ExecutionLock, LockError, LockToken, SessionStore, StoreError, VariableStore,
};
use crate::variables::{Contact, LookupError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, expiration: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + expiration,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

// ============================================================================
// Session store
// ============================================================================

/// Session pointers kept in a map
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<(String, String), Expiring<String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_state_id(&self, flow_id: &str, user: &str) -> Result<Option<String>, StoreError> {
        let key = (flow_id.to_string(), user.to_string());
        let mut entries = locked(&self.entries);
        match entries.get(&key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_state_id(
        &self,
        flow_id: &str,
        user: &str,
        state_id: &str,
        expiration: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = locked(&self.entries);
        entries.retain(|_, entry| entry.is_live());
        entries.insert(
            (flow_id.to_string(), user.to_string()),
            Expiring::new(state_id.to_string(), expiration),
        );
        Ok(())
    }

    async fn delete_state_id(&self, flow_id: &str, user: &str) -> Result<(), StoreError> {
        locked(&self.entries).remove(&(flow_id.to_string(), user.to_string()));
        Ok(())
    }
}

// ============================================================================
// Variable store
// ============================================================================

type VariableKey = (String, String, String);

/// Context variables kept in a map
#[derive(Debug, Default)]
pub struct MemoryVariableStore {
    entries: Mutex<HashMap<VariableKey, Expiring<String>>>,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableStore for MemoryVariableStore {
    async fn get_variable(
        &self,
        flow_id: &str,
        user: &str,
        name: &str,
    ) -> Result<Option<String>, LookupError> {
        let key = (flow_id.to_string(), user.to_string(), name.to_string());
        let mut entries = locked(&self.entries);
        match entries.get(&key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_variable(
        &self,
        flow_id: &str,
        user: &str,
        name: &str,
        value: &str,
        expiration: Duration,
    ) -> Result<(), LookupError> {
        let mut entries = locked(&self.entries);
        entries.retain(|_, entry| entry.is_live());
        entries.insert(
            (flow_id.to_string(), user.to_string(), name.to_string()),
            Expiring::new(value.to_string(), expiration),
        );
        Ok(())
    }
}

// ============================================================================
// Contact directory
// ============================================================================

/// Contacts kept in a map; unknown users are reported as not found
#[derive(Debug, Default)]
pub struct MemoryContactDirectory {
    contacts: RwLock<HashMap<String, Contact>>,
}

impl MemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(self, contact: Contact) -> Self {
        self.insert(contact);
        self
    }

    pub fn insert(&self, contact: Contact) {
        self.contacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contact.identity.clone(), contact);
    }
}

#[async_trait]
impl ContactDirectory for MemoryContactDirectory {
    async fn get_contact(&self, user: &str) -> Result<Option<Contact>, LookupError> {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned()
            .map(Some)
            .ok_or(LookupError::NotFound)
    }
}

// ============================================================================
// Execution lock
// ============================================================================

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(5);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Leases kept in a map, polled with exponential backoff while contended
#[derive(Debug, Default)]
pub struct MemoryExecutionLock {
    leases: Mutex<HashMap<String, Expiring<String>>>,
}

impl MemoryExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by a live lease
    pub fn is_held(&self, key: &str) -> bool {
        locked(&self.leases).get(key).is_some_and(Expiring::is_live)
    }

    fn try_acquire(&self, key: &str, expiration: Duration) -> Option<LockToken> {
        let mut leases = locked(&self.leases);
        if leases.get(key).is_some_and(Expiring::is_live) {
            return None;
        }
        let id = uuid::Uuid::new_v4().to_string();
        leases.insert(key.to_string(), Expiring::new(id.clone(), expiration));
        Some(LockToken {
            key: key.to_string(),
            id,
        })
    }
}

#[async_trait]
impl ExecutionLock for MemoryExecutionLock {
    async fn acquire(
        &self,
        key: &str,
        expiration: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        let deadline = Instant::now() + wait;
        let mut delay = MIN_POLL_INTERVAL;
        loop {
            if let Some(token) = self.try_acquire(key, expiration) {
                return Ok(token);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Busy);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut leases = locked(&self.leases);
        // A lease that expired and was taken by someone else is theirs now
        if leases.get(&token.key).is_some_and(|lease| lease.value == token.id) {
            leases.remove(&token.key);
        }
        Ok(())
    }
}
