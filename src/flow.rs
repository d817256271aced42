//! Flow definitions
//!
//! A flow is parsed from JSON into [`Flow`] and must pass [`Flow::validate`]
//! before the engine will run it. The resulting [`ValidatedFlow`] is
//! immutable and can be shared across sessions.

mod model;
mod validate;

pub use model::{Action, Comparison, Condition, Flow, Input, Output, State, VariableSource};
pub use validate::{PatternSet, ValidatedFlow};

use std::path::Path;
use thiserror::Error;

/// Errors raised while loading a flow
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Failed to parse flow JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read flow file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed flow '{flow_id}': {reason}")]
    Malformed { flow_id: String, reason: String },
}

impl FlowError {
    pub(crate) fn malformed(flow_id: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            flow_id: flow_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl Flow {
    /// Parse a flow document. The result still has to be validated.
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
