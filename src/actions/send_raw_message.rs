//! `SendRawMessage` action

use super::{parse_settings, ActionError, ActionHandler};
use crate::context::Context;
use crate::message::Envelope;
use crate::runtime::Sender;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Sends pre-serialized content with an explicit media type
///
/// JSON media types (`application/json` or any `+json` suffix) are parsed
/// so the transport receives a document; everything else goes out as text.
pub struct SendRawMessageAction {
    sender: Arc<dyn Sender>,
}

impl SendRawMessageAction {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRawMessageSettings {
    raw_content: String,
    media_type: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn is_json_media_type(media_type: &str) -> bool {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

#[async_trait]
impl ActionHandler for SendRawMessageAction {
    fn action_type(&self) -> &'static str {
        "SendRawMessage"
    }

    async fn execute(&self, ctx: &Context<'_>, settings: Value) -> Result<(), ActionError> {
        let settings: SendRawMessageSettings = parse_settings(settings)?;
        if settings.media_type.trim().is_empty() {
            return Err(ActionError::InvalidSettings("mediaType is empty".to_string()));
        }

        let content = if is_json_media_type(&settings.media_type) {
            serde_json::from_str(&settings.raw_content).map_err(|e| {
                ActionError::InvalidSettings(format!("rawContent is not valid JSON: {e}"))
            })?
        } else {
            Value::String(settings.raw_content)
        };

        let envelope = Envelope::new(ctx.user(), settings.media_type, content)
            .with_metadata(settings.metadata);
        self.sender.send_message(&envelope).await?;
        tracing::debug!(
            user = %ctx.user(),
            message_id = %envelope.id,
            media_type = %envelope.media_type,
            "Raw message sent"
        );
        Ok(())
    }
}
