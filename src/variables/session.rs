//! Per-session context variables

use super::{LookupError, LookupScope, VariableProvider};
use crate::flow::VariableSource;
use crate::runtime::VariableStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Reads and writes the `context` source through a [`VariableStore`],
/// scoped to the pass's flow and user
pub struct ContextVariableProvider {
    store: Arc<dyn VariableStore>,
    expiration: Duration,
}

impl ContextVariableProvider {
    pub fn new(store: Arc<dyn VariableStore>, expiration: Duration) -> Self {
        Self { store, expiration }
    }
}

#[async_trait]
impl VariableProvider for ContextVariableProvider {
    fn source(&self) -> VariableSource {
        VariableSource::Context
    }

    async fn get(
        &self,
        name: &str,
        scope: &LookupScope<'_>,
    ) -> Result<Option<String>, LookupError> {
        self.store.get_variable(scope.flow_id, scope.user, name).await
    }

    async fn set(
        &self,
        name: &str,
        value: &str,
        scope: &LookupScope<'_>,
    ) -> Result<(), LookupError> {
        self.store
            .set_variable(scope.flow_id, scope.user, name, value, self.expiration)
            .await
    }
}
