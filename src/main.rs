//! Console host for the flow engine
//!
//! Loads a flow from the file given as the first argument and feeds it one
//! input per stdin line. Replies are printed to stdout; logs go to stderr.

use async_trait::async_trait;
use flow_engine::actions::TrackEventAction;
use flow_engine::message::Envelope;
use flow_engine::runtime::{
    EventTracker, MemoryContactDirectory, MemoryExecutionLock, MemorySessionStore,
    MemoryVariableStore, SendError, Sender, StoreError, TrackedEvent,
};
use flow_engine::variables::{ContactVariableProvider, ContextVariableProvider};
use flow_engine::{
    ActionPipeline, ActionRegistry, EngineConfig, EngineError, FlowEngine, UserInput,
    VariableProviderRegistry,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Prints outbound messages
struct ConsoleSender;

#[async_trait]
impl Sender for ConsoleSender {
    async fn send_message(&self, envelope: &Envelope) -> Result<(), SendError> {
        println!("< {}", envelope.content_text());
        Ok(())
    }
}

/// Logs tracked events
struct LogEventTracker;

#[async_trait]
impl EventTracker for LogEventTracker {
    async fn track(&self, event: &TrackedEvent) -> Result<(), StoreError> {
        tracing::info!(
            category = %event.category,
            action = %event.action,
            extras = ?event.extras,
            "Event tracked"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flow_engine=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let flow_path = std::env::args()
        .nth(1)
        .ok_or("usage: flow-engine <flow.json>")?;
    let user = std::env::var("FLOW_ENGINE_USER").unwrap_or_else(|_| "console".to_string());
    let config = EngineConfig::from_env();

    // Collaborators
    let variables = VariableProviderRegistry::standard()
        .with_provider(ContextVariableProvider::new(
            Arc::new(MemoryVariableStore::new()),
            config.context_expiration,
        ))
        .with_provider(ContactVariableProvider::new(Arc::new(
            MemoryContactDirectory::new(),
        )));
    let actions = ActionRegistry::standard(Arc::new(ConsoleSender))
        .with_handler(TrackEventAction::new(Arc::new(LogEventTracker)));

    let engine = FlowEngine::new(
        config,
        Arc::new(MemorySessionStore::new()),
        Arc::new(MemoryExecutionLock::new()),
        Arc::new(variables),
        ActionPipeline::new(Arc::new(actions)),
    );

    tracing::info!(path = %flow_path, "Loading flow");
    let flow = engine.load_flow_file(&flow_path)?;
    tracing::info!(flow_id = %flow.id(), states = flow.states().len(), user = %user, "Flow loaded");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                shutdown.cancel();
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        match engine
            .process_input(&flow, &user, UserInput::text(line.trim()), &shutdown)
            .await
        {
            Ok(outcome) => tracing::debug!(?outcome, "Pass complete"),
            Err(EngineError::Cancelled) => break,
            Err(e) => eprintln!("error: {e}"),
        }
    }

    Ok(())
}
