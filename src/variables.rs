//! Variable sources feeding conditions and settings placeholders
//!
//! Each [`VariableSource`] is served by one [`VariableProvider`]. The registry
//! absorbs lookup failures: a source that is missing, reports not found or
//! fails outright resolves to an absent value, never to an error.

mod contact;
mod flow;
mod input;
mod session;

pub use contact::{Contact, ContactVariableProvider};
pub use flow::FlowVariableProvider;
pub use input::InputVariableProvider;
pub use session::ContextVariableProvider;

use crate::flow::VariableSource;
use crate::message::UserInput;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a single variable lookup or write
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Variable resource not found")]
    NotFound,
    #[error("Variable operation not supported")]
    NotSupported,
    #[error("Variable lookup failed: {0}")]
    Failed(String),
}

impl LookupError {
    /// The source cannot answer for this name; treated as an absent value
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NotFound | Self::NotSupported)
    }
}

/// What a provider may know about the pass it is resolving for
#[derive(Debug, Clone, Copy)]
pub struct LookupScope<'a> {
    pub flow_id: &'a str,
    pub user: &'a str,
    pub input: &'a UserInput,
    pub flow_variables: &'a HashMap<String, String>,
}

/// A named lookup source
#[async_trait]
pub trait VariableProvider: Send + Sync {
    fn source(&self) -> VariableSource;

    async fn get(
        &self,
        name: &str,
        scope: &LookupScope<'_>,
    ) -> Result<Option<String>, LookupError>;

    /// Write a variable. Read-only sources keep the default.
    async fn set(
        &self,
        _name: &str,
        _value: &str,
        _scope: &LookupScope<'_>,
    ) -> Result<(), LookupError> {
        Err(LookupError::NotSupported)
    }
}

/// Providers keyed by source tag
#[derive(Clone, Default)]
pub struct VariableProviderRegistry {
    providers: HashMap<VariableSource, Arc<dyn VariableProvider>>,
}

impl VariableProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the input and flow providers, which need no collaborators
    pub fn standard() -> Self {
        Self::new()
            .with_provider(InputVariableProvider)
            .with_provider(FlowVariableProvider)
    }

    pub fn with_provider(mut self, provider: impl VariableProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    /// Register a provider, replacing any previous one for the same source
    pub fn register(
        &mut self,
        provider: Arc<dyn VariableProvider>,
    ) -> Option<Arc<dyn VariableProvider>> {
        self.providers.insert(provider.source(), provider)
    }

    pub fn contains(&self, source: &VariableSource) -> bool {
        self.providers.contains_key(source)
    }

    /// Resolve `name` from `source`; every failure resolves to `None`
    pub async fn resolve(
        &self,
        source: &VariableSource,
        name: &str,
        scope: &LookupScope<'_>,
    ) -> Option<String> {
        let Some(provider) = self.providers.get(source) else {
            tracing::debug!(%source, variable = name, "No provider registered for source");
            return None;
        };

        match provider.get(name, scope).await {
            Ok(value) => value,
            Err(e) if e.is_unavailable() => {
                tracing::debug!(%source, variable = name, error = %e, "Variable unavailable");
                None
            }
            Err(e) => {
                tracing::warn!(%source, variable = name, error = %e, "Variable lookup failed");
                None
            }
        }
    }

    pub async fn set(
        &self,
        source: &VariableSource,
        name: &str,
        value: &str,
        scope: &LookupScope<'_>,
    ) -> Result<(), LookupError> {
        match self.providers.get(source) {
            Some(provider) => provider.set(name, value, scope).await,
            None => Err(LookupError::NotSupported),
        }
    }
}
