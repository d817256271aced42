//! Runtime for processing inputs against flows
//!
//! The [`FlowEngine`] orchestrates a pass; collaborators are reached through
//! the traits in [`traits`], with in-process versions in [`memory`].

mod executor;
mod lease;
pub mod memory;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{lock_key, EngineError, FlowEngine, ProcessOutcome, SessionCommit};
pub use lease::Lease;
pub use memory::{
    MemoryContactDirectory, MemoryExecutionLock, MemorySessionStore, MemoryVariableStore,
};
pub use traits::*;
