//! Contact profile variables
//!
//! Contact fields are read through a fixed accessor table instead of any
//! runtime introspection. Lookups normalize the requested name, so
//! `phoneNumber`, `phone_number` and `PHONENUMBER` hit the same field.

use super::{LookupError, LookupScope, VariableProvider};
use crate::flow::VariableSource;
use crate::runtime::ContactDirectory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

pub const CONTACT_EXTRAS_PREFIX: &str = "extras.";

/// A user's contact profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culture: Option<String>,
    /// UTC offset in hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_uri: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, String>,
}

impl Contact {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }
}

type FieldAccessor = fn(&Contact) -> Option<String>;

/// Readable contact fields, keyed by normalized name
const CONTACT_FIELDS: &[(&str, FieldAccessor)] = &[
    ("identity", |c| Some(c.identity.clone())),
    ("name", |c| c.name.clone()),
    ("address", |c| c.address.clone()),
    ("city", |c| c.city.clone()),
    ("email", |c| c.email.clone()),
    ("phonenumber", |c| c.phone_number.clone()),
    ("cellphonenumber", |c| c.cell_phone_number.clone()),
    ("gender", |c| c.gender.clone()),
    ("culture", |c| c.culture.clone()),
    ("timezone", |c| c.timezone.map(|offset| offset.to_string())),
    ("photouri", |c| c.photo_uri.clone()),
];

fn field_accessor(normalized: &str) -> Option<FieldAccessor> {
    CONTACT_FIELDS
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|&(_, accessor)| accessor)
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// The key after a case-insensitive `extras.` prefix
fn extras_key(name: &str) -> Option<&str> {
    let prefix = name.get(..CONTACT_EXTRAS_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(CONTACT_EXTRAS_PREFIX) {
        name.get(CONTACT_EXTRAS_PREFIX.len()..)
    } else {
        None
    }
}

/// Serves the `contact` source
///
/// Looks the contact up in a primary directory and, when that one has no
/// answer, in an optional fallback directory. Contacts can be cached per
/// user for a fixed expiration.
pub struct ContactVariableProvider {
    primary: Arc<dyn ContactDirectory>,
    fallback: Option<Arc<dyn ContactDirectory>>,
    cache_expiration: Option<Duration>,
    contacts: Mutex<HashMap<String, (Instant, Contact)>>,
    /// Normalized name -> accessor, memoized from the field table
    fields: RwLock<HashMap<String, Option<FieldAccessor>>>,
}

impl ContactVariableProvider {
    pub fn new(primary: Arc<dyn ContactDirectory>) -> Self {
        Self {
            primary,
            fallback: None,
            cache_expiration: None,
            contacts: Mutex::new(HashMap::new()),
            fields: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ContactDirectory>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_cache(mut self, expiration: Duration) -> Self {
        self.cache_expiration = Some(expiration);
        self
    }

    fn cached_accessor(&self, name: &str) -> Option<FieldAccessor> {
        let normalized = normalize(name);
        if let Some(hit) = self
            .fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalized)
        {
            return *hit;
        }
        let accessor = field_accessor(&normalized);
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalized, accessor);
        accessor
    }

    fn cached_contact(&self, user: &str) -> Option<Contact> {
        self.cache_expiration?;
        let mut contacts = self.contacts.lock().unwrap_or_else(PoisonError::into_inner);
        let (expires_at, contact) = contacts.get(user)?;
        if *expires_at > Instant::now() {
            return Some(contact.clone());
        }
        contacts.remove(user);
        None
    }

    fn remember(&self, user: &str, contact: &Contact) {
        let Some(expiration) = self.cache_expiration else {
            return;
        };
        let now = Instant::now();
        let mut contacts = self.contacts.lock().unwrap_or_else(PoisonError::into_inner);
        contacts.retain(|_, (expires_at, _)| *expires_at > now);
        contacts.insert(user.to_string(), (now + expiration, contact.clone()));
    }

    async fn load_contact(&self, user: &str) -> Result<Option<Contact>, LookupError> {
        if let Some(contact) = self.cached_contact(user) {
            return Ok(Some(contact));
        }

        let mut contact = absent_if_unavailable(self.primary.get_contact(user).await)?;
        if contact.is_none() {
            if let Some(fallback) = &self.fallback {
                contact = absent_if_unavailable(fallback.get_contact(user).await)?;
            }
        }

        if let Some(contact) = &contact {
            self.remember(user, contact);
        }
        Ok(contact)
    }
}

fn absent_if_unavailable(
    result: Result<Option<Contact>, LookupError>,
) -> Result<Option<Contact>, LookupError> {
    match result {
        Err(e) if e.is_unavailable() => Ok(None),
        other => other,
    }
}

#[async_trait]
impl VariableProvider for ContactVariableProvider {
    fn source(&self) -> VariableSource {
        VariableSource::Contact
    }

    async fn get(
        &self,
        name: &str,
        scope: &LookupScope<'_>,
    ) -> Result<Option<String>, LookupError> {
        let Some(contact) = self.load_contact(scope.user).await? else {
            return Ok(None);
        };
        if let Some(key) = extras_key(name) {
            return Ok(contact.extras.get(key).cloned());
        }
        Ok(self.cached_accessor(name).and_then(|accessor| accessor(&contact)))
    }
}
