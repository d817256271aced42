//! Static variables declared by the flow

use super::{LookupError, LookupScope, VariableProvider};
use crate::flow::VariableSource;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlowVariableProvider;

#[async_trait]
impl VariableProvider for FlowVariableProvider {
    fn source(&self) -> VariableSource {
        VariableSource::Flow
    }

    async fn get(
        &self,
        name: &str,
        scope: &LookupScope<'_>,
    ) -> Result<Option<String>, LookupError> {
        Ok(scope.flow_variables.get(name).cloned())
    }
}
