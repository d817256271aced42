//! Action handlers and the pipeline that runs them
//!
//! Handlers are stateless singletons keyed by action type; everything a
//! single invocation needs arrives through the pass [`Context`] and the
//! action's settings.

mod placeholders;
mod send_message;
mod send_raw_message;
mod set_variable;
mod track_event;

pub use placeholders::substitute;
pub use send_message::SendMessageAction;
pub use send_raw_message::SendRawMessageAction;
pub use set_variable::SetVariableAction;
pub use track_event::TrackEventAction;

use crate::condition;
use crate::context::{Context, ContextError};
use crate::flow::Action;
use crate::runtime::{SendError, Sender, StoreError};
use crate::variables::LookupError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// How a failed action affects the rest of its list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the list and the pass
    Fatal,
    /// Log, count and continue with the next action
    Recoverable,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    #[error("Invalid action settings: {0}")]
    InvalidSettings(String),
    #[error("No handler registered for action type '{0}'")]
    UnknownType(String),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("Failed to write variable '{name}': {source}")]
    Variable { name: String, source: LookupError },
    #[error("Failed to record event: {0}")]
    Track(#[from] StoreError),
    #[error("Action timed out after {0:?}")]
    Timeout(Duration),
    #[error("Action cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl From<ContextError> for ActionError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::Write { name, source } => Self::Variable { name, source },
        }
    }
}

/// A fatal failure, with its position in the action list
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Action #{index} ({action_type}) failed: {source}")]
pub struct ActionFailure {
    pub index: usize,
    pub action_type: String,
    #[source]
    pub source: ActionError,
}

/// Deserialize settings into a handler's typed form
pub(crate) fn parse_settings<T: serde::de::DeserializeOwned>(
    settings: Value,
) -> Result<T, ActionError> {
    serde_json::from_value(settings).map_err(|e| ActionError::InvalidSettings(e.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Action type this handler serves, e.g. `SendMessage`
    fn action_type(&self) -> &str;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Fatal
    }

    /// Run with settings whose placeholders are already substituted
    async fn execute(&self, ctx: &Context<'_>, settings: Value) -> Result<(), ActionError>;
}

/// Handlers keyed by action type
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messaging and variable handlers over `sender`
    ///
    /// `TrackEvent` needs an event tracker and is registered separately.
    pub fn standard(sender: Arc<dyn Sender>) -> Self {
        Self::new()
            .with_handler(SendMessageAction::new(sender.clone()))
            .with_handler(SendRawMessageAction::new(sender))
            .with_handler(SetVariableAction)
    }

    pub fn with_handler(mut self, handler: impl ActionHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.action_type().to_string(), handler);
    }

    pub fn get(&self, action_type: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(action_type)
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Counters for one completed action list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub executed: usize,
    /// Guard evaluated false
    pub skipped: usize,
    /// Failed under a recoverable policy
    pub recovered: usize,
}

/// Runs action lists strictly in order
#[derive(Clone)]
pub struct ActionPipeline {
    registry: Arc<ActionRegistry>,
}

impl ActionPipeline {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub async fn run(
        &self,
        actions: &[Action],
        ctx: &Context<'_>,
    ) -> Result<PipelineReport, ActionFailure> {
        let mut report = PipelineReport::default();

        for (index, action) in actions.iter().enumerate() {
            let fail = |source: ActionError| ActionFailure {
                index,
                action_type: action.action_type.clone(),
                source,
            };

            if ctx.is_cancelled() {
                return Err(fail(ActionError::Cancelled));
            }

            let guard_holds = condition::evaluate_all(&action.conditions, ctx)
                .await
                .map_err(|e| fail(e.into()))?;
            if !guard_holds {
                tracing::debug!(
                    action_type = %action.action_type,
                    index,
                    "Action guard false, skipping"
                );
                report.skipped += 1;
                continue;
            }

            let Some(handler) = self.registry.get(&action.action_type) else {
                return Err(fail(ActionError::UnknownType(action.action_type.clone())));
            };

            match Self::invoke(handler.as_ref(), action, ctx).await {
                Ok(()) => {
                    tracing::debug!(action_type = %action.action_type, index, "Action executed");
                    report.executed += 1;
                }
                Err(ActionError::Cancelled) => return Err(fail(ActionError::Cancelled)),
                Err(e) => match Self::policy(handler.as_ref(), action) {
                    FailurePolicy::Recoverable => {
                        tracing::warn!(
                            flow_id = %ctx.flow_id(),
                            user = %ctx.user(),
                            action_type = %action.action_type,
                            index,
                            error = %e,
                            "Recoverable action failure"
                        );
                        report.recovered += 1;
                    }
                    FailurePolicy::Fatal => return Err(fail(e)),
                },
            }
        }

        Ok(report)
    }

    fn policy(handler: &dyn ActionHandler, action: &Action) -> FailurePolicy {
        match action.continue_on_error {
            Some(true) => FailurePolicy::Recoverable,
            Some(false) => FailurePolicy::Fatal,
            None => handler.failure_policy(),
        }
    }

    async fn invoke(
        handler: &dyn ActionHandler,
        action: &Action,
        ctx: &Context<'_>,
    ) -> Result<(), ActionError> {
        let settings = substitute(&action.settings, ctx).await?;

        let execution = async {
            match action.timeout {
                Some(secs) => {
                    let limit = Duration::from_secs(secs);
                    tokio::time::timeout(limit, handler.execute(ctx, settings))
                        .await
                        .map_err(|_| ActionError::Timeout(limit))?
                }
                None => handler.execute(ctx, settings).await,
            }
        };

        tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => Err(ActionError::Cancelled),
            result = execution => result,
        }
    }
}
