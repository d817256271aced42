//! Engine timing configuration

use std::time::Duration;

/// Expirations and waits used by every processing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Lease lifetime; bounds how long a crashed holder blocks a session
    pub execution_lock_expiration: Duration,
    /// How long a pass waits for a busy session before giving up
    pub execution_lock_wait: Duration,
    /// Lifetime of the session pointer after each write
    pub session_expiration: Duration,
    /// Lifetime of `context` variables after each write
    pub context_expiration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_lock_expiration: Duration::from_secs(5 * 60),
            execution_lock_wait: Duration::from_secs(10),
            session_expiration: Duration::from_secs(30 * 60),
            context_expiration: Duration::from_secs(30 * 60),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FLOW_ENGINE_*_SECS` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|value| match value.trim().parse::<u64>() {
                    Ok(secs) => Some(Duration::from_secs(secs)),
                    Err(e) => {
                        tracing::warn!(
                            variable = name,
                            value = %value,
                            error = %e,
                            "Ignoring invalid duration"
                        );
                        None
                    }
                })
                .unwrap_or(default)
        };

        Self {
            execution_lock_expiration: secs(
                "FLOW_ENGINE_LOCK_EXPIRATION_SECS",
                defaults.execution_lock_expiration,
            ),
            execution_lock_wait: secs("FLOW_ENGINE_LOCK_WAIT_SECS", defaults.execution_lock_wait),
            session_expiration: secs(
                "FLOW_ENGINE_SESSION_EXPIRATION_SECS",
                defaults.session_expiration,
            ),
            context_expiration: secs(
                "FLOW_ENGINE_CONTEXT_EXPIRATION_SECS",
                defaults.context_expiration,
            ),
        }
    }
}
