//! `TrackEvent` action

use super::{parse_settings, ActionError, ActionHandler, FailurePolicy};
use crate::context::Context;
use crate::runtime::{EventTracker, TrackedEvent};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Records an analytics event; failures never abort the pass by default
pub struct TrackEventAction {
    tracker: Arc<dyn EventTracker>,
}

impl TrackEventAction {
    pub fn new(tracker: Arc<dyn EventTracker>) -> Self {
        Self { tracker }
    }
}

#[derive(Debug, Deserialize)]
struct TrackEventSettings {
    category: String,
    action: String,
    #[serde(default)]
    extras: HashMap<String, String>,
}

#[async_trait]
impl ActionHandler for TrackEventAction {
    fn action_type(&self) -> &'static str {
        "TrackEvent"
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Recoverable
    }

    async fn execute(&self, ctx: &Context<'_>, settings: Value) -> Result<(), ActionError> {
        let settings: TrackEventSettings = parse_settings(settings)?;
        if settings.category.is_empty() || settings.action.is_empty() {
            return Err(ActionError::InvalidSettings(
                "category and action are required".to_string(),
            ));
        }

        let event = TrackedEvent {
            flow_id: ctx.flow_id().to_string(),
            user: ctx.user().to_string(),
            category: settings.category,
            action: settings.action,
            extras: settings.extras,
            occurred_at: Utc::now(),
        };
        self.tracker.track(&event).await?;
        Ok(())
    }
}
