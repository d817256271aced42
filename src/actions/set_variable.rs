//! `SetVariable` action

use super::{parse_settings, ActionError, ActionHandler};
use crate::context::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Writes a session variable through the `context` source
#[derive(Debug, Clone, Copy, Default)]
pub struct SetVariableAction;

#[derive(Debug, Deserialize)]
struct SetVariableSettings {
    variable: String,
    #[serde(default)]
    value: Value,
}

#[async_trait]
impl ActionHandler for SetVariableAction {
    fn action_type(&self) -> &'static str {
        "SetVariable"
    }

    async fn execute(&self, ctx: &Context<'_>, settings: Value) -> Result<(), ActionError> {
        let settings: SetVariableSettings = parse_settings(settings)?;
        if settings.variable.trim().is_empty() {
            return Err(ActionError::InvalidSettings("variable is empty".to_string()));
        }

        let value = match settings.value {
            Value::Null => String::new(),
            Value::String(text) => text,
            other => other.to_string(),
        };
        ctx.set_variable(&settings.variable, &value).await?;
        Ok(())
    }
}
