//! Named properties of the triggering input

use super::{LookupError, LookupScope, VariableProvider};
use crate::flow::VariableSource;
use async_trait::async_trait;

/// Serves `content`, `type` and `length` of the triggering input
#[derive(Debug, Clone, Copy, Default)]
pub struct InputVariableProvider;

#[async_trait]
impl VariableProvider for InputVariableProvider {
    fn source(&self) -> VariableSource {
        VariableSource::Input
    }

    async fn get(
        &self,
        name: &str,
        scope: &LookupScope<'_>,
    ) -> Result<Option<String>, LookupError> {
        let value = match name.to_ascii_lowercase().as_str() {
            "content" => scope.input.value(),
            "type" => Some(scope.input.media_type.clone()),
            "length" => Some(
                scope
                    .input
                    .value()
                    .map_or(0, |text| text.chars().count())
                    .to_string(),
            ),
            _ => None,
        };
        Ok(value)
    }
}
