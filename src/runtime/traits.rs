//! Trait abstractions for the engine's collaborators
//!
//! The engine never talks to a transport, a database or a lock service
//! directly. These traits are the seams; [`super::memory`] has in-process
//! implementations and [`super::testing`] has recording mocks.

use crate::message::Envelope;
use crate::variables::{Contact, LookupError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a storage-like collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by the message sender
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Message rejected: {0}")]
    Rejected(String),
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Failure acquiring or releasing an execution lock
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The wait budget elapsed while another holder kept the lock
    #[error("Execution lock is busy")]
    Busy,
    #[error("Execution lock unavailable: {0}")]
    Unavailable(String),
}

/// Proof of a held execution lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub id: String,
}

/// An analytics event recorded by the `TrackEvent` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEvent {
    pub flow_id: String,
    pub user: String,
    pub category: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Outbound message transport
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send_message(&self, envelope: &Envelope) -> Result<(), SendError>;
}

/// Durable `(flow, user) -> state id` pointers
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_state_id(&self, flow_id: &str, user: &str) -> Result<Option<String>, StoreError>;

    async fn set_state_id(
        &self,
        flow_id: &str,
        user: &str,
        state_id: &str,
        expiration: Duration,
    ) -> Result<(), StoreError>;

    async fn delete_state_id(&self, flow_id: &str, user: &str) -> Result<(), StoreError>;
}

/// Distributed mutual exclusion keyed by session
#[async_trait]
pub trait ExecutionLock: Send + Sync {
    /// Acquire `key` for at most `expiration`, waiting up to `wait` for a
    /// current holder to release it.
    async fn acquire(
        &self,
        key: &str,
        expiration: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError>;

    async fn release(&self, token: &LockToken) -> Result<(), LockError>;
}

/// Per-session variable storage backing the `context` source
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn get_variable(
        &self,
        flow_id: &str,
        user: &str,
        name: &str,
    ) -> Result<Option<String>, LookupError>;

    async fn set_variable(
        &self,
        flow_id: &str,
        user: &str,
        name: &str,
        value: &str,
        expiration: Duration,
    ) -> Result<(), LookupError>;
}

/// Contact profile lookup backing the `contact` source
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn get_contact(&self, user: &str) -> Result<Option<Contact>, LookupError>;
}

/// Analytics sink for the `TrackEvent` action
#[async_trait]
pub trait EventTracker: Send + Sync {
    async fn track(&self, event: &TrackedEvent) -> Result<(), StoreError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: Sender + ?Sized> Sender for Arc<T> {
    async fn send_message(&self, envelope: &Envelope) -> Result<(), SendError> {
        (**self).send_message(envelope).await
    }
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn get_state_id(&self, flow_id: &str, user: &str) -> Result<Option<String>, StoreError> {
        (**self).get_state_id(flow_id, user).await
    }

    async fn set_state_id(
        &self,
        flow_id: &str,
        user: &str,
        state_id: &str,
        expiration: Duration,
    ) -> Result<(), StoreError> {
        (**self).set_state_id(flow_id, user, state_id, expiration).await
    }

    async fn delete_state_id(&self, flow_id: &str, user: &str) -> Result<(), StoreError> {
        (**self).delete_state_id(flow_id, user).await
    }
}

#[async_trait]
impl<T: ExecutionLock + ?Sized> ExecutionLock for Arc<T> {
    async fn acquire(
        &self,
        key: &str,
        expiration: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        (**self).acquire(key, expiration, wait).await
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        (**self).release(token).await
    }
}

#[async_trait]
impl<T: VariableStore + ?Sized> VariableStore for Arc<T> {
    async fn get_variable(
        &self,
        flow_id: &str,
        user: &str,
        name: &str,
    ) -> Result<Option<String>, LookupError> {
        (**self).get_variable(flow_id, user, name).await
    }

    async fn set_variable(
        &self,
        flow_id: &str,
        user: &str,
        name: &str,
        value: &str,
        expiration: Duration,
    ) -> Result<(), LookupError> {
        (**self)
            .set_variable(flow_id, user, name, value, expiration)
            .await
    }
}

#[async_trait]
impl<T: ContactDirectory + ?Sized> ContactDirectory for Arc<T> {
    async fn get_contact(&self, user: &str) -> Result<Option<Contact>, LookupError> {
        (**self).get_contact(user).await
    }
}

#[async_trait]
impl<T: EventTracker + ?Sized> EventTracker for Arc<T> {
    async fn track(&self, event: &TrackedEvent) -> Result<(), StoreError> {
        (**self).track(event).await
    }
}
