//! Flow document types
//!
//! These mirror the JSON shape of a flow definition. They carry no behavior
//! beyond small accessors; validation lives in [`super::validate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A conversational state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub states: Vec<State>,
    /// Static variables, readable through the `flow` source
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
}

/// A node of the flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub id: String,
    #[serde(default)]
    pub root: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Input>,
    /// Run when the state is entered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_actions: Vec<Action>,
    /// Run when the state is left, after an output was chosen
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_actions: Vec<Action>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl State {
    /// Whether the walk must stop here and wait for the next user input
    pub fn awaits_input(&self) -> bool {
        self.input.as_ref().is_some_and(|input| !input.bypass)
    }

    /// A state with no outputs ends the conversation
    pub fn is_terminal(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Name of the context variable the accepted input is bound to, if any
    pub fn input_variable(&self) -> Option<&str> {
        self.input
            .as_ref()
            .and_then(|input| input.variable.as_deref())
            .filter(|name| !name.is_empty())
    }
}

/// Input expectation of a state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default)]
    pub bypass: bool,
}

/// A conditional edge to another state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub state_id: String,
}

/// A single predicate over a resolved variable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub source: VariableSource,
    #[serde(default)]
    pub comparison: Comparison,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Comparison operators of the condition algebra
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    #[default]
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    ApproximateTo,
    Exists,
    NotExists,
}

/// Where a variable is looked up
///
/// The set is open: any tag other than the built-in ones becomes
/// [`VariableSource::Custom`] and is served by whichever provider registers it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VariableSource {
    /// The triggering input
    #[default]
    Input,
    /// Per-session variables
    Context,
    /// The user's contact profile
    Contact,
    /// The flow's static variables
    Flow,
    Custom(String),
}

impl VariableSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Input => "input",
            Self::Context => "context",
            Self::Contact => "contact",
            Self::Flow => "flow",
            Self::Custom(tag) => tag,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<String> for VariableSource {
    fn from(tag: String) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "input" => Self::Input,
            "context" => Self::Context,
            "contact" => Self::Contact,
            "flow" => Self::Flow,
            _ => Self::Custom(tag),
        }
    }
}

impl From<&str> for VariableSource {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<VariableSource> for String {
    fn from(source: VariableSource) -> Self {
        match source {
            VariableSource::Custom(tag) => tag,
            builtin => builtin.as_str().to_string(),
        }
    }
}

impl fmt::Display for VariableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named side effect bound to state entry or exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub settings: Value,
    /// Guard; the action is skipped unless all hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Overrides the handler's failure policy when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}
