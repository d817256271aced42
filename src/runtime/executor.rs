//! Flow engine executor
//!
//! One call to [`FlowEngine::process_input`] is one processing pass:
//! lock the session, find the current state, walk the graph until a state
//! awaits input or the conversation ends, then commit the session pointer.

use super::lease::Lease;
use super::traits::{ExecutionLock, LockError, SessionStore, StoreError};
use crate::actions::{ActionError, ActionFailure, ActionPipeline};
use crate::condition;
use crate::config::EngineConfig;
use crate::context::{Context, ContextError};
use crate::flow::{Flow, FlowError, State, ValidatedFlow};
use crate::message::UserInput;
use crate::variables::{LookupError, VariableProviderRegistry};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    /// Another pass held the session for the whole wait budget
    #[error("Session is busy")]
    Busy,
    #[error("Malformed flow: {0}")]
    MalformedFlow(String),
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
    #[error("Execution lock error: {0}")]
    Lock(LockError),
    #[error(transparent)]
    Action(ActionFailure),
    #[error("Failed to bind input to variable '{name}': {source}")]
    Variable { name: String, source: LookupError },
    #[error("Processing cancelled")]
    Cancelled,
}

impl From<LockError> for EngineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy => Self::Busy,
            other @ LockError::Unavailable(_) => Self::Lock(other),
        }
    }
}

impl From<ActionFailure> for EngineError {
    fn from(failure: ActionFailure) -> Self {
        match failure.source {
            ActionError::Cancelled => Self::Cancelled,
            _ => Self::Action(failure),
        }
    }
}

impl From<ContextError> for EngineError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::Write { name, source } => Self::Variable { name, source },
        }
    }
}

impl From<FlowError> for EngineError {
    fn from(e: FlowError) -> Self {
        Self::MalformedFlow(e.to_string())
    }
}

/// What a completed pass did
///
/// `Transitioned` does not imply the conversation is waiting for more input:
/// a walk that reaches a fall-through state with no matching output also
/// ends there, with the session pointer cleared. Only a state that awaits
/// input keeps the pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// At least one output matched, possibly ending at a dead end
    Transitioned {
        from: String,
        /// Where the walk stopped
        to: String,
        /// Every state visited, `from` and `to` included
        path: Vec<String>,
        recovered_failures: usize,
    },
    /// No output of the current state matched the input
    Unhandled { state_id: String },
}

/// The single session pointer write a pass ends with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommit {
    /// The walk stopped at a state awaiting input
    Persist(String),
    /// The conversation ended or the input was not handled
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    LockAcquired,
    LoadingSession,
    WalkingGraph,
    CommittingSession,
    LockReleased,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LockAcquired => "lock_acquired",
            Self::LoadingSession => "loading_session",
            Self::WalkingGraph => "walking_graph",
            Self::CommittingSession => "committing_session",
            Self::LockReleased => "lock_released",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

fn enter(phase: Phase) {
    tracing::trace!(%phase, "Entering phase");
}

struct Walk {
    commit: SessionCommit,
    outcome: ProcessOutcome,
}

/// Session lock key
pub fn lock_key(flow_id: &str, user: &str) -> String {
    format!("{flow_id}:{user}")
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = T>,
) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Cancelled),
        output = future => Ok(output),
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Interprets flows against user inputs
///
/// Cheap to share behind an `Arc`; passes for different sessions run fully
/// in parallel and passes for the same session are serialized by the
/// execution lock.
pub struct FlowEngine {
    config: EngineConfig,
    sessions: Arc<dyn SessionStore>,
    lock: Arc<dyn ExecutionLock>,
    variables: Arc<VariableProviderRegistry>,
    actions: ActionPipeline,
}

impl FlowEngine {
    pub fn new(
        config: EngineConfig,
        sessions: Arc<dyn SessionStore>,
        lock: Arc<dyn ExecutionLock>,
        variables: Arc<VariableProviderRegistry>,
        actions: ActionPipeline,
    ) -> Self {
        Self {
            config,
            sessions,
            lock,
            variables,
            actions,
        }
    }

    /// Parse and validate a flow, rejecting action types nothing handles
    pub fn load_flow(&self, json: &str) -> Result<ValidatedFlow, EngineError> {
        let flow = Flow::from_json(json)?.validate()?;
        self.check_action_types(&flow)?;
        Ok(flow)
    }

    pub fn load_flow_file(&self, path: impl AsRef<Path>) -> Result<ValidatedFlow, EngineError> {
        let flow = Flow::from_file(path)?.validate()?;
        self.check_action_types(&flow)?;
        Ok(flow)
    }

    fn check_action_types(&self, flow: &ValidatedFlow) -> Result<(), EngineError> {
        for state in flow.states() {
            let actions = state.input_actions.iter().chain(&state.output_actions);
            for action in actions {
                if !self.actions.registry().contains(&action.action_type) {
                    return Err(EngineError::MalformedFlow(format!(
                        "flow '{}': state '{}' uses unregistered action type '{}'",
                        flow.id(),
                        state.id,
                        action.action_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run one processing pass for `user`'s input
    pub async fn process_input(
        &self,
        flow: &ValidatedFlow,
        user: &str,
        input: UserInput,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError> {
        let span = tracing::info_span!("process_input", flow_id = %flow.id(), user = %user);
        self.process(flow, user, input, cancel).instrument(span).await
    }

    async fn process(
        &self,
        flow: &ValidatedFlow,
        user: &str,
        input: UserInput,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError> {
        enter(Phase::Idle);
        let key = lock_key(flow.id(), user);
        let lease = match cancellable(
            cancel,
            Lease::acquire(
                self.lock.clone(),
                &key,
                self.config.execution_lock_expiration,
                self.config.execution_lock_wait,
            ),
        )
        .await?
        {
            Ok(lease) => lease,
            Err(e) => {
                tracing::info!(error = %e, "Could not acquire session lock");
                return Err(e.into());
            }
        };
        enter(Phase::LockAcquired);

        let result = self.process_locked(flow, user, input, cancel).await;

        // Release failures are logged by the lease; expiry reclaims the key
        let _ = lease.release().await;
        enter(Phase::LockReleased);

        match &result {
            Ok(outcome) => tracing::info!(?outcome, "Input processed"),
            Err(e) => tracing::warn!(error = %e, "Input processing failed"),
        }
        enter(Phase::Done);
        result
    }

    async fn process_locked(
        &self,
        flow: &ValidatedFlow,
        user: &str,
        input: UserInput,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError> {
        enter(Phase::LoadingSession);
        let stored = cancellable(cancel, self.sessions.get_state_id(flow.id(), user)).await??;
        let start = match stored.as_deref() {
            None => flow.root(),
            Some(state_id) => flow.state(state_id).unwrap_or_else(|| {
                tracing::warn!(state_id, "Stored state is not in the flow, restarting at root");
                flow.root()
            }),
        };

        let ctx = Context::new(flow, user, input, self.variables.clone(), cancel.clone());

        enter(Phase::WalkingGraph);
        // A failed walk leaves the pointer at its pre-pass value
        let walk = self.walk(start, &ctx).await?;

        enter(Phase::CommittingSession);
        self.commit(flow.id(), user, &walk.commit, cancel).await?;
        Ok(walk.outcome)
    }

    async fn walk(&self, start: &State, ctx: &Context<'_>) -> Result<Walk, EngineError> {
        let flow = ctx.flow();
        let max_path = flow.states().len() + 1;
        let mut path = vec![start.id.clone()];
        let mut current = start;
        let mut recovered_failures = 0;

        if current.awaits_input() {
            if let Some(variable) = current.input_variable() {
                let value = ctx.input().value().unwrap_or_default();
                ctx.set_variable(variable, &value).await?;
            }
        }

        loop {
            let Some(output) = condition::choose_output(current, ctx).await? else {
                if path.len() == 1 {
                    tracing::info!(state_id = %current.id, "No output matched input");
                    return Ok(Walk {
                        commit: SessionCommit::Clear,
                        outcome: ProcessOutcome::Unhandled {
                            state_id: current.id.clone(),
                        },
                    });
                }
                tracing::warn!(
                    state_id = %current.id,
                    "Walk stopped at a state with no matching output"
                );
                return Ok(Walk {
                    commit: SessionCommit::Clear,
                    outcome: ProcessOutcome::Transitioned {
                        from: start.id.clone(),
                        to: current.id.clone(),
                        path,
                        recovered_failures,
                    },
                });
            };

            let report = self.actions.run(&current.output_actions, ctx).await?;
            recovered_failures += report.recovered;

            let target = flow.state(&output.state_id).ok_or_else(|| {
                EngineError::MalformedFlow(format!(
                    "output target '{}' does not exist",
                    output.state_id
                ))
            })?;
            path.push(target.id.clone());
            if path.len() > max_path {
                return Err(EngineError::MalformedFlow(format!(
                    "walk from '{}' visited more than {max_path} states without awaiting input",
                    start.id
                )));
            }
            tracing::debug!(from = %current.id, to = %target.id, "Transition");

            let report = self.actions.run(&target.input_actions, ctx).await?;
            recovered_failures += report.recovered;
            current = target;

            let commit = if current.awaits_input() {
                SessionCommit::Persist(current.id.clone())
            } else if current.is_terminal() {
                SessionCommit::Clear
            } else {
                continue;
            };
            return Ok(Walk {
                commit,
                outcome: ProcessOutcome::Transitioned {
                    from: start.id.clone(),
                    to: current.id.clone(),
                    path,
                    recovered_failures,
                },
            });
        }
    }

    async fn commit(
        &self,
        flow_id: &str,
        user: &str,
        commit: &SessionCommit,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        match commit {
            SessionCommit::Persist(state_id) => {
                cancellable(
                    cancel,
                    self.sessions
                        .set_state_id(flow_id, user, state_id, self.config.session_expiration),
                )
                .await??;
            }
            SessionCommit::Clear => {
                cancellable(cancel, self.sessions.delete_state_id(flow_id, user)).await??;
            }
        }
        tracing::debug!(?commit, "Session pointer committed");
        Ok(())
    }
}
