//! Conversation flow engine
//!
//! Interprets declarative conversation graphs against a stream of user
//! inputs. For each input the engine locks the user's session, walks the
//! graph from the state the user is waiting in, runs the actions bound to
//! the states it passes through, and records where the user stopped.

pub mod actions;
pub mod condition;
pub mod config;
pub mod context;
pub mod flow;
pub mod message;
pub mod runtime;
pub mod variables;

pub use actions::{ActionHandler, ActionPipeline, ActionRegistry};
pub use config::EngineConfig;
pub use flow::{Flow, FlowError, ValidatedFlow};
pub use message::{Envelope, UserInput};
pub use runtime::{EngineError, FlowEngine, ProcessOutcome};
pub use variables::VariableProviderRegistry;
