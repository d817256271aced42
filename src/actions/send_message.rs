//! `SendMessage` action

use super::{parse_settings, ActionError, ActionHandler};
use crate::context::Context;
use crate::message::{Envelope, TEXT_PLAIN};
use crate::runtime::Sender;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Sends a message document to the user
pub struct SendMessageAction {
    sender: Arc<dyn Sender>,
}

impl SendMessageAction {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }
}

fn default_media_type() -> String {
    TEXT_PLAIN.to_string()
}

#[derive(Debug, Deserialize)]
struct SendMessageSettings {
    #[serde(rename = "type", default = "default_media_type")]
    media_type: String,
    content: Value,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[async_trait]
impl ActionHandler for SendMessageAction {
    fn action_type(&self) -> &'static str {
        "SendMessage"
    }

    async fn execute(&self, ctx: &Context<'_>, settings: Value) -> Result<(), ActionError> {
        let settings: SendMessageSettings = parse_settings(settings)?;
        let envelope = Envelope::new(ctx.user(), settings.media_type, settings.content)
            .with_metadata(settings.metadata);

        self.sender.send_message(&envelope).await?;
        tracing::debug!(
            flow_id = %ctx.flow_id(),
            user = %ctx.user(),
            message_id = %envelope.id,
            media_type = %envelope.media_type,
            "Message sent"
        );
        Ok(())
    }
}
