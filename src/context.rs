//! Per-pass variable resolution
//!
//! A [`Context`] lives for exactly one processing pass. It wraps the
//! triggering input and memoizes every `(source, variable)` lookup, so a
//! condition evaluated against several outputs costs one provider call.

use crate::flow::{ValidatedFlow, VariableSource};
use crate::message::UserInput;
use crate::variables::{LookupError, LookupScope, VariableProviderRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Processing pass was cancelled")]
    Cancelled,
    #[error("Failed to write context variable '{name}': {source}")]
    Write { name: String, source: LookupError },
}

type CacheKey = (VariableSource, String);

pub struct Context<'f> {
    flow: &'f ValidatedFlow,
    user: String,
    input: UserInput,
    registry: Arc<VariableProviderRegistry>,
    cache: Mutex<HashMap<CacheKey, Option<String>>>,
    cancel: CancellationToken,
}

impl<'f> Context<'f> {
    pub fn new(
        flow: &'f ValidatedFlow,
        user: impl Into<String>,
        input: UserInput,
        registry: Arc<VariableProviderRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            flow,
            user: user.into(),
            input,
            registry,
            cache: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn flow(&self) -> &'f ValidatedFlow {
        self.flow
    }

    pub fn flow_id(&self) -> &str {
        self.flow.id()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn input(&self) -> &UserInput {
        &self.input
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn scope(&self) -> LookupScope<'_> {
        LookupScope {
            flow_id: self.flow.id(),
            user: &self.user,
            input: &self.input,
            flow_variables: self.flow.variables(),
        }
    }

    /// Resolve a variable, memoized for the rest of the pass
    ///
    /// The `input` source with no variable name is the input's own textual
    /// value and never reaches a provider.
    pub async fn resolve(
        &self,
        source: &VariableSource,
        variable: Option<&str>,
    ) -> Result<Option<String>, ContextError> {
        let Some(name) = variable.filter(|name| !name.is_empty()) else {
            return Ok(match source {
                VariableSource::Input => self.input.value(),
                _ => None,
            });
        };

        let key = (source.clone(), name.to_string());
        if let Some(hit) = self.cache().get(&key) {
            return Ok(hit.clone());
        }

        let scope = self.scope();
        let value = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(ContextError::Cancelled),
            value = self.registry.resolve(source, name, &scope) => value,
        };

        self.cache().insert(key, value.clone());
        Ok(value)
    }

    /// Write a session variable through the `context` source
    pub async fn set_variable(&self, name: &str, value: &str) -> Result<(), ContextError> {
        let scope = self.scope();
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(ContextError::Cancelled),
            result = self.registry.set(&VariableSource::Context, name, value, &scope) => result,
        };
        result.map_err(|source| ContextError::Write {
            name: name.to_string(),
            source,
        })?;

        tracing::debug!(
            flow_id = %self.flow.id(),
            user = %self.user,
            variable = name,
            "Context variable set"
        );
        self.cache().insert(
            (VariableSource::Context, name.to_string()),
            Some(value.to_string()),
        );
        Ok(())
    }

    /// Resolve a `source.name` reference as used by settings placeholders
    pub async fn resolve_reference(&self, reference: &str) -> Result<Option<String>, ContextError> {
        let (source, name) = self.parse_reference(reference);
        self.resolve(&source, name).await
    }

    /// Split a reference into its source and variable name
    ///
    /// A prefix that names neither a built-in source nor a registered custom
    /// one is part of the name, looked up in the `context` source.
    fn parse_reference<'r>(&self, reference: &'r str) -> (VariableSource, Option<&'r str>) {
        let reference = reference.trim();
        if reference.eq_ignore_ascii_case(VariableSource::Input.as_str()) {
            return (VariableSource::Input, None);
        }
        if let Some((prefix, name)) = reference.split_once('.') {
            let source = VariableSource::from(prefix);
            if source.is_builtin() || self.registry.contains(&source) {
                return (source, Some(name));
            }
        }
        (VariableSource::Context, Some(reference))
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Option<String>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
