//! Mock implementations for testing
//!
//! These mocks enable end-to-end testing of processing passes without a
//! real transport or store.

use super::executor::{EngineError, FlowEngine, ProcessOutcome};
use super::memory::{
    MemoryContactDirectory, MemoryExecutionLock, MemorySessionStore, MemoryVariableStore,
};
use super::traits::*;
use crate::actions::{
    ActionError, ActionHandler, ActionPipeline, ActionRegistry, FailurePolicy, TrackEventAction,
};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::flow::{Flow, ValidatedFlow};
use crate::message::{Envelope, UserInput};
use crate::variables::{
    Contact, ContactVariableProvider, ContextVariableProvider, VariableProviderRegistry,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TEST_USER: &str = "alice";

// ============================================================================
// Mock Sender
// ============================================================================

/// Records every envelope; optionally rejects them all
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Envelope>>,
    failure: Option<SendError>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: SendError) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent contents rendered as text
    pub fn contents(&self) -> Vec<String> {
        self.sent().iter().map(Envelope::content_text).collect()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send_message(&self, envelope: &Envelope) -> Result<(), SendError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

// ============================================================================
// Mock Session Store
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Get,
    Set { state_id: String, expiration: Duration },
    Delete,
}

/// In-memory session store that records every call
#[derive(Default)]
pub struct RecordingSessionStore {
    inner: MemorySessionStore,
    calls: Mutex<Vec<SessionCall>>,
}

impl RecordingSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pointer without recording the call
    pub async fn seed(&self, flow_id: &str, user: &str, state_id: &str) {
        self.inner
            .set_state_id(flow_id, user, state_id, Duration::from_secs(60))
            .await
            .unwrap();
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded calls other than reads
    pub fn writes(&self) -> Vec<SessionCall> {
        self.calls()
            .into_iter()
            .filter(|call| *call != SessionCall::Get)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub async fn state_id(&self, flow_id: &str, user: &str) -> Option<String> {
        self.inner.get_state_id(flow_id, user).await.unwrap()
    }
}

#[async_trait]
impl SessionStore for RecordingSessionStore {
    async fn get_state_id(&self, flow_id: &str, user: &str) -> Result<Option<String>, StoreError> {
        self.calls.lock().unwrap().push(SessionCall::Get);
        self.inner.get_state_id(flow_id, user).await
    }

    async fn set_state_id(
        &self,
        flow_id: &str,
        user: &str,
        state_id: &str,
        expiration: Duration,
    ) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(SessionCall::Set {
            state_id: state_id.to_string(),
            expiration,
        });
        self.inner.set_state_id(flow_id, user, state_id, expiration).await
    }

    async fn delete_state_id(&self, flow_id: &str, user: &str) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(SessionCall::Delete);
        self.inner.delete_state_id(flow_id, user).await
    }
}

// ============================================================================
// Mock Event Tracker
// ============================================================================

#[derive(Default)]
pub struct RecordingEventTracker {
    events: Mutex<Vec<TrackedEvent>>,
    fail: bool,
}

impl RecordingEventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventTracker for RecordingEventTracker {
    async fn track(&self, event: &TrackedEvent) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::new("analytics offline"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Mock Action Handlers
// ============================================================================

/// Always fails with `"<type> failed"`
pub struct FailingAction {
    action_type: String,
    policy: FailurePolicy,
}

impl FailingAction {
    pub fn fatal(action_type: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            policy: FailurePolicy::Fatal,
        }
    }

    pub fn recoverable(action_type: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            policy: FailurePolicy::Recoverable,
        }
    }
}

#[async_trait]
impl ActionHandler for FailingAction {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn execute(&self, _ctx: &Context<'_>, _settings: Value) -> Result<(), ActionError> {
        Err(ActionError::Failed(format!("{} failed", self.action_type)))
    }
}

/// Sleeps before succeeding
pub struct SlowAction {
    action_type: String,
    delay: Duration,
}

impl SlowAction {
    pub fn new(action_type: &str, delay: Duration) -> Self {
        Self {
            action_type: action_type.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl ActionHandler for SlowAction {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(&self, _ctx: &Context<'_>, _settings: Value) -> Result<(), ActionError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Journals `start:<input>` and `end:<input>` around a delay
pub struct JournalAction {
    journal: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl JournalAction {
    pub fn new(journal: Arc<Mutex<Vec<String>>>, delay: Duration) -> Self {
        Self { journal, delay }
    }
}

#[async_trait]
impl ActionHandler for JournalAction {
    fn action_type(&self) -> &'static str {
        "Journal"
    }

    async fn execute(&self, ctx: &Context<'_>, _settings: Value) -> Result<(), ActionError> {
        let input = ctx.input().value().unwrap_or_default();
        self.journal.lock().unwrap().push(format!("start:{input}"));
        tokio::time::sleep(self.delay).await;
        self.journal.lock().unwrap().push(format!("end:{input}"));
        Ok(())
    }
}

// ============================================================================
// Flows and contexts
// ============================================================================

/// Root awaits text; `Marco!` answers `Polo!`, `Ping!` answers `Pong!`
pub fn ping_flow_json() -> String {
    json!({
        "id": "ping-pong",
        "states": [
            {
                "id": "root",
                "root": true,
                "input": {},
                "outputs": [
                    { "stateId": "marco", "conditions": [{ "values": ["Marco!"] }] },
                    { "stateId": "ping", "conditions": [{ "values": ["Ping!"] }] }
                ]
            },
            {
                "id": "marco",
                "inputActions": [
                    { "type": "SendMessage", "settings": { "type": "text/plain", "content": "Polo!" } }
                ]
            },
            {
                "id": "ping",
                "inputActions": [
                    { "type": "SendMessage", "settings": { "type": "text/plain", "content": "Pong!" } }
                ]
            }
        ]
    })
    .to_string()
}

pub fn ping_flow() -> ValidatedFlow {
    flow_from(serde_json::from_str(&ping_flow_json()).unwrap())
}

pub fn flow_from(document: Value) -> ValidatedFlow {
    serde_json::from_value::<Flow>(document)
        .unwrap()
        .validate()
        .unwrap()
}

/// Standard providers plus an in-memory `context` source
pub fn test_registry(store: Arc<dyn VariableStore>) -> VariableProviderRegistry {
    VariableProviderRegistry::standard()
        .with_provider(ContextVariableProvider::new(store, Duration::from_secs(60)))
}

pub fn context(flow: &ValidatedFlow, input: UserInput) -> Context<'_> {
    context_with_cancel(flow, input, CancellationToken::new())
}

pub fn context_with_cancel(
    flow: &ValidatedFlow,
    input: UserInput,
    cancel: CancellationToken,
) -> Context<'_> {
    Context::new(
        flow,
        TEST_USER,
        input,
        Arc::new(test_registry(Arc::new(MemoryVariableStore::new()))),
        cancel,
    )
}

// ============================================================================
// Test Engine Builder
// ============================================================================

/// A [`FlowEngine`] wired to recording and in-memory collaborators
pub struct TestEngine {
    pub engine: Arc<FlowEngine>,
    pub sender: Arc<RecordingSender>,
    pub sessions: Arc<RecordingSessionStore>,
    pub lock: Arc<MemoryExecutionLock>,
    pub variables: Arc<MemoryVariableStore>,
    pub contacts: Arc<MemoryContactDirectory>,
    pub tracker: Arc<RecordingEventTracker>,
}

impl TestEngine {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> TestEngineBuilder {
        TestEngineBuilder::default()
    }

    pub async fn send(
        &self,
        flow: &ValidatedFlow,
        text: &str,
    ) -> Result<ProcessOutcome, EngineError> {
        self.engine
            .process_input(flow, TEST_USER, UserInput::text(text), &CancellationToken::new())
            .await
    }

    pub async fn state_id(&self, flow: &ValidatedFlow) -> Option<String> {
        self.sessions.state_id(flow.id(), TEST_USER).await
    }

    pub async fn variable(&self, flow: &ValidatedFlow, name: &str) -> Option<String> {
        self.variables.get_variable(flow.id(), TEST_USER, name).await.unwrap()
    }
}

#[derive(Default)]
pub struct TestEngineBuilder {
    config: EngineConfig,
    handlers: Vec<Arc<dyn ActionHandler>>,
    contacts: Vec<Contact>,
    tracker: Option<RecordingEventTracker>,
}

impl TestEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.config.execution_lock_wait = wait;
        self
    }

    pub fn handler(mut self, handler: impl ActionHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn contact(mut self, contact: Contact) -> Self {
        self.contacts.push(contact);
        self
    }

    pub fn tracker(mut self, tracker: RecordingEventTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> TestEngine {
        let sender = Arc::new(RecordingSender::new());
        let sessions = Arc::new(RecordingSessionStore::new());
        let lock = Arc::new(MemoryExecutionLock::new());
        let variables = Arc::new(MemoryVariableStore::new());
        let contacts = Arc::new(MemoryContactDirectory::new());
        let tracker = Arc::new(self.tracker.unwrap_or_default());
        for contact in self.contacts {
            contacts.insert(contact);
        }

        let registry = VariableProviderRegistry::standard()
            .with_provider(ContextVariableProvider::new(
                variables.clone(),
                self.config.context_expiration,
            ))
            .with_provider(ContactVariableProvider::new(contacts.clone()));

        let mut actions = ActionRegistry::standard(sender.clone())
            .with_handler(TrackEventAction::new(tracker.clone()));
        for handler in self.handlers {
            actions.register(handler);
        }

        let engine = FlowEngine::new(
            self.config,
            sessions.clone(),
            lock.clone(),
            Arc::new(registry),
            ActionPipeline::new(Arc::new(actions)),
        );

        TestEngine {
            engine: Arc::new(engine),
            sender,
            sessions,
            lock,
            variables,
            contacts,
            tracker,
        }
    }
}

// ============================================================================
// End-to-end tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionFailure;
    use crate::runtime::lock_key;

    fn outcome(from: &str, path: &[&str], recovered_failures: usize) -> ProcessOutcome {
        ProcessOutcome::Transitioned {
            from: from.to_string(),
            to: path.last().unwrap().to_string(),
            path: path.iter().map(ToString::to_string).collect(),
            recovered_failures,
        }
    }

    fn send(content: &str) -> Value {
        json!({ "type": "SendMessage", "settings": { "type": "text/plain", "content": content } })
    }

    /// `hello` leads to a question bound to `name`, answered with a greeting
    fn question_flow() -> ValidatedFlow {
        flow_from(json!({
            "id": "greeting",
            "states": [
                {
                    "id": "root",
                    "root": true,
                    "input": {},
                    "outputs": [{ "stateId": "ask", "conditions": [{ "values": ["hello"] }] }]
                },
                {
                    "id": "ask",
                    "input": { "variable": "name" },
                    "inputActions": [send("What's your name?")],
                    "outputs": [
                        { "stateId": "explode", "conditions": [{ "values": ["boom"] }] },
                        { "stateId": "greet", "order": 1 }
                    ]
                },
                {
                    "id": "greet",
                    "inputActions": [send("Hi {{context.name}}!")]
                },
                {
                    "id": "explode",
                    "inputActions": [{ "type": "Explode" }]
                }
            ]
        }))
    }

    // ------------------------------------------------------------------------
    // Transitions and the session pointer
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ping_sends_pong_and_clears_pointer() {
        let test = TestEngine::new().build();
        let flow = ping_flow();

        let result = test.send(&flow, "Ping!").await.unwrap();

        assert_eq!(result, outcome("root", &["root", "ping"], 0));
        assert_eq!(test.sender.contents(), vec!["Pong!"]);
        assert_eq!(test.sender.sent()[0].to, TEST_USER);
        assert_eq!(test.sessions.writes(), vec![SessionCall::Delete]);
        assert_eq!(test.state_id(&flow).await, None);
        assert!(!test.lock.is_held(&lock_key(flow.id(), TEST_USER)));
    }

    #[tokio::test]
    async fn test_unmatched_input_is_unhandled() {
        let test = TestEngine::new().build();
        let flow = ping_flow();

        let result = test.send(&flow, "XPTO!").await.unwrap();

        assert_eq!(
            result,
            ProcessOutcome::Unhandled {
                state_id: "root".to_string()
            }
        );
        assert!(test.sender.sent().is_empty());
        assert_eq!(test.sessions.writes(), vec![SessionCall::Delete]);
    }

    #[tokio::test]
    async fn test_awaiting_target_persists_pointer() {
        let test = TestEngine::new().build();
        let flow = question_flow();

        let result = test.send(&flow, "hello").await.unwrap();

        assert_eq!(result, outcome("root", &["root", "ask"], 0));
        assert_eq!(test.state_id(&flow).await.as_deref(), Some("ask"));
        assert_eq!(
            test.sessions.writes(),
            vec![SessionCall::Set {
                state_id: "ask".to_string(),
                expiration: EngineConfig::default().session_expiration,
            }]
        );
    }

    #[tokio::test]
    async fn test_resumes_at_stored_state_and_binds_input() {
        let test = TestEngine::new().build();
        let flow = question_flow();

        test.send(&flow, "hello").await.unwrap();
        let result = test.send(&flow, "Alice").await.unwrap();

        assert_eq!(result, outcome("ask", &["ask", "greet"], 0));
        assert_eq!(test.variable(&flow, "name").await.as_deref(), Some("Alice"));
        assert_eq!(test.sender.contents(), vec!["What's your name?", "Hi Alice!"]);
        assert_eq!(test.state_id(&flow).await, None);
    }

    #[tokio::test]
    async fn test_absent_input_binds_empty_string() {
        let test = TestEngine::new().build();
        let flow = question_flow();
        test.sessions.seed(flow.id(), TEST_USER, "ask").await;

        test.engine
            .process_input(&flow, TEST_USER, UserInput::empty(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(test.variable(&flow, "name").await.as_deref(), Some(""));
        assert_eq!(test.sender.contents(), vec!["Hi !"]);
    }

    #[tokio::test]
    async fn test_unknown_stored_state_restarts_at_root() {
        let test = TestEngine::new().build();
        let flow = ping_flow();
        test.sessions.seed(flow.id(), TEST_USER, "removed-state").await;

        let result = test.send(&flow, "Ping!").await.unwrap();

        assert_eq!(result, outcome("root", &["root", "ping"], 0));
    }

    #[tokio::test]
    async fn test_bypass_chain_runs_until_awaiting_state() {
        let test = TestEngine::new().build();
        let flow = flow_from(json!({
            "id": "chain",
            "states": [
                { "id": "root", "root": true, "input": { "variable": "first" }, "outputs": [{ "stateId": "b1" }] },
                {
                    "id": "b1",
                    "input": { "bypass": true, "variable": "ignored" },
                    "inputActions": [send("one")],
                    "outputs": [{ "stateId": "b2" }]
                },
                { "id": "b2", "inputActions": [send("two")], "outputs": [{ "stateId": "wait" }] },
                { "id": "wait", "input": {}, "inputActions": [send("three")], "outputs": [{ "stateId": "root" }] }
            ]
        }));

        let result = test.send(&flow, "go").await.unwrap();

        assert_eq!(result, outcome("root", &["root", "b1", "b2", "wait"], 0));
        assert_eq!(test.sender.contents(), vec!["one", "two", "three"]);
        assert_eq!(test.state_id(&flow).await.as_deref(), Some("wait"));
        assert_eq!(test.variable(&flow, "first").await.as_deref(), Some("go"));
        assert_eq!(test.variable(&flow, "ignored").await, None);
    }

    #[tokio::test]
    async fn test_fall_through_without_match_clears_pointer() {
        let test = TestEngine::new().build();
        let flow = flow_from(json!({
            "id": "dead-end",
            "states": [
                { "id": "root", "root": true, "input": {}, "outputs": [{ "stateId": "b1" }] },
                {
                    "id": "b1",
                    "inputActions": [send("checking")],
                    "outputs": [{ "stateId": "root", "conditions": [{ "values": ["never"] }] }]
                }
            ]
        }));
        test.sessions.seed(flow.id(), TEST_USER, "root").await;

        let result = test.send(&flow, "go").await.unwrap();

        assert_eq!(result, outcome("root", &["root", "b1"], 0));
        assert_eq!(test.state_id(&flow).await, None);
    }

    #[tokio::test]
    async fn test_output_actions_run_before_entry_actions() {
        let test = TestEngine::new().build();
        let flow = flow_from(json!({
            "id": "ordering",
            "states": [
                {
                    "id": "root",
                    "root": true,
                    "input": {},
                    "outputActions": [send("leaving root")],
                    "outputs": [{ "stateId": "end" }]
                },
                { "id": "end", "inputActions": [send("entered end")] }
            ]
        }));

        test.send(&flow, "anything").await.unwrap();

        assert_eq!(test.sender.contents(), vec!["leaving root", "entered end"]);
    }

    // ------------------------------------------------------------------------
    // Variables in conditions and settings
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_matches_on_context_variable() {
        let test = TestEngine::new().build();
        let flow = flow_from(json!({
            "id": "tiers",
            "states": [
                {
                    "id": "root",
                    "root": true,
                    "input": {},
                    "outputs": [
                        {
                            "stateId": "vip",
                            "conditions": [{
                                "source": "context",
                                "variable": "plan",
                                "comparison": "matches",
                                "values": ["^(gold|platinum)$"]
                            }]
                        },
                        { "stateId": "regular", "order": 1 }
                    ]
                },
                { "id": "vip", "inputActions": [send("Welcome back, VIP")] },
                { "id": "regular", "inputActions": [send("Welcome")] }
            ]
        }));

        test.send(&flow, "hi").await.unwrap();
        test.variables
            .set_variable(flow.id(), TEST_USER, "plan", "gold", Duration::from_secs(60))
            .await
            .unwrap();
        test.send(&flow, "hi").await.unwrap();

        assert_eq!(test.sender.contents(), vec!["Welcome", "Welcome back, VIP"]);
    }

    #[tokio::test]
    async fn test_contact_variables() {
        let mut contact = Contact::new(TEST_USER);
        contact.name = Some("Alice".to_string());
        contact.extras.insert("plan".to_string(), "gold".to_string());
        let test = TestEngine::new().contact(contact).build();
        let flow = flow_from(json!({
            "id": "contact",
            "states": [
                {
                    "id": "root",
                    "root": true,
                    "input": {},
                    "outputs": [{
                        "stateId": "vip",
                        "conditions": [{ "source": "contact", "variable": "extras.plan", "values": ["gold"] }]
                    }]
                },
                { "id": "vip", "inputActions": [send("Hello {{contact.name}}, you are {{contact.extras.plan}}")] }
            ]
        }));

        test.send(&flow, "hi").await.unwrap();

        assert_eq!(test.sender.contents(), vec!["Hello Alice, you are gold"]);
    }

    #[tokio::test]
    async fn test_approximate_input() {
        let test = TestEngine::new().build();
        let flow = flow_from(json!({
            "id": "fuzzy",
            "states": [
                {
                    "id": "root",
                    "root": true,
                    "input": {},
                    "outputs": [{
                        "stateId": "ping",
                        "conditions": [{ "comparison": "approximateTo", "values": ["Ping!"] }]
                    }]
                },
                { "id": "ping", "inputActions": [send("Pong!")] }
            ]
        }));

        assert!(matches!(
            test.send(&flow, "Pamg!").await.unwrap(),
            ProcessOutcome::Transitioned { .. }
        ));
        assert!(matches!(
            test.send(&flow, "Pamh!").await.unwrap(),
            ProcessOutcome::Unhandled { .. }
        ));
        assert_eq!(test.sender.contents(), vec!["Pong!"]);
    }

    #[tokio::test]
    async fn test_set_variable_and_track_event_actions() {
        let test = TestEngine::new().build();
        let flow = flow_from(json!({
            "id": "tracking",
            "states": [
                { "id": "root", "root": true, "input": {}, "outputs": [{ "stateId": "end" }] },
                {
                    "id": "end",
                    "inputActions": [
                        { "type": "SetVariable", "settings": { "variable": "last", "value": "{{input}}" } },
                        {
                            "type": "TrackEvent",
                            "settings": { "category": "inputs", "action": "{{context.last}}" }
                        }
                    ]
                }
            ]
        }));

        test.send(&flow, "Ping!").await.unwrap();

        assert_eq!(test.variable(&flow, "last").await.as_deref(), Some("Ping!"));
        let events = test.tracker.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "Ping!");
    }

    // ------------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_fatal_action_leaves_pointer_untouched() {
        let test = TestEngine::new().handler(FailingAction::fatal("Explode")).build();
        let flow = question_flow();

        test.send(&flow, "hello").await.unwrap();
        test.sessions.clear_calls();
        let err = test.send(&flow, "boom").await.unwrap_err();

        let EngineError::Action(ActionFailure { action_type, .. }) = err else {
            panic!("Expected an action failure, got {err:?}");
        };
        assert_eq!(action_type, "Explode");
        assert_eq!(test.sessions.writes(), vec![]);
        assert_eq!(test.state_id(&flow).await.as_deref(), Some("ask"));
        assert!(!test.lock.is_held(&lock_key(flow.id(), TEST_USER)));
    }

    #[tokio::test]
    async fn test_recoverable_failures_are_counted() {
        let test = TestEngine::new()
            .handler(FailingAction::recoverable("Wobble"))
            .tracker(RecordingEventTracker::failing())
            .build();
        let flow = flow_from(json!({
            "id": "wobbly",
            "states": [
                { "id": "root", "root": true, "input": {}, "outputs": [{ "stateId": "end" }] },
                {
                    "id": "end",
                    "inputActions": [
                        { "type": "Wobble" },
                        { "type": "TrackEvent", "settings": { "category": "c", "action": "a" } },
                        send("still here")
                    ]
                }
            ]
        }));

        let result = test.send(&flow, "go").await.unwrap();

        assert_eq!(result, outcome("root", &["root", "end"], 2));
        assert_eq!(test.sender.contents(), vec!["still here"]);
    }

    #[tokio::test]
    async fn test_guarded_action_is_skipped() {
        let test = TestEngine::new().build();
        let flow = flow_from(json!({
            "id": "guards",
            "states": [
                { "id": "root", "root": true, "input": {}, "outputs": [{ "stateId": "end" }] },
                {
                    "id": "end",
                    "inputActions": [
                        {
                            "type": "SendMessage",
                            "settings": { "content": "only for Ping!" },
                            "conditions": [{ "values": ["Ping!"] }]
                        },
                        send("always")
                    ]
                }
            ]
        }));

        test.send(&flow, "Marco!").await.unwrap();
        test.send(&flow, "Ping!").await.unwrap();

        assert_eq!(test.sender.contents(), vec!["always", "only for Ping!", "always"]);
    }

    #[tokio::test]
    async fn test_load_flow_checks_action_types() {
        let test = TestEngine::new().build();
        assert!(test.engine.load_flow(&ping_flow_json()).is_ok());

        let document = json!({
            "id": "teleport",
            "states": [{
                "id": "root",
                "root": true,
                "input": {},
                "outputActions": [{ "type": "Teleport" }]
            }]
        });
        let err = test.engine.load_flow(&document.to_string()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedFlow(reason) if reason.contains("Teleport")));

        let err = test.engine.load_flow("{ not json").unwrap_err();
        assert!(matches!(err, EngineError::MalformedFlow(_)));
    }

    // ------------------------------------------------------------------------
    // Concurrency and cancellation
    // ------------------------------------------------------------------------

    fn journal_flow() -> ValidatedFlow {
        flow_from(json!({
            "id": "journal",
            "states": [
                {
                    "id": "root",
                    "root": true,
                    "input": {},
                    "outputs": [{
                        "stateId": "work",
                        "conditions": [{ "comparison": "contains", "values": ["Ping"] }]
                    }]
                },
                { "id": "work", "inputActions": [{ "type": "Journal" }] }
            ]
        }))
    }

    #[tokio::test]
    async fn test_same_session_passes_do_not_interleave() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let test = TestEngine::new()
            .handler(JournalAction::new(journal.clone(), Duration::from_millis(50)))
            .build();
        let flow = journal_flow();

        let (first, second) =
            futures::join!(test.send(&flow, "Ping 1"), test.send(&flow, "Ping 2"));
        first.unwrap();
        second.unwrap();

        let journal = journal.lock().unwrap().clone();
        assert_eq!(journal.len(), 4);
        let first_input = journal[0].strip_prefix("start:").unwrap();
        assert_eq!(journal[1], format!("end:{first_input}"));
        let second_input = journal[2].strip_prefix("start:").unwrap();
        assert_ne!(first_input, second_input);
        assert_eq!(journal[3], format!("end:{second_input}"));
    }

    #[tokio::test]
    async fn test_other_sessions_run_in_parallel() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let test = TestEngine::new()
            .handler(JournalAction::new(journal.clone(), Duration::from_millis(50)))
            .lock_wait(Duration::ZERO)
            .build();
        let flow = journal_flow();
        let cancel = CancellationToken::new();

        let (alice, bob) = futures::join!(
            test.engine
                .process_input(&flow, "alice", UserInput::text("Ping a"), &cancel),
            test.engine
                .process_input(&flow, "bob", UserInput::text("Ping b"), &cancel)
        );
        alice.unwrap();
        bob.unwrap();

        let journal = journal.lock().unwrap().clone();
        assert!(journal[0].starts_with("start:"));
        assert!(journal[1].starts_with("start:"));
    }

    #[tokio::test]
    async fn test_busy_when_wait_budget_elapses() {
        let test = TestEngine::new().lock_wait(Duration::from_millis(20)).build();
        let flow = ping_flow();
        let held = test
            .lock
            .acquire(
                &lock_key(flow.id(), TEST_USER),
                Duration::from_secs(60),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let err = test.send(&flow, "Ping!").await.unwrap_err();

        assert!(matches!(err, EngineError::Busy));
        assert!(test.sessions.calls().is_empty());
        assert!(test.sender.sent().is_empty());
        test.lock.release(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_releases_lock() {
        let test = TestEngine::new()
            .handler(SlowAction::new("Slow", Duration::from_secs(30)))
            .build();
        let flow = flow_from(json!({
            "id": "slow",
            "states": [
                { "id": "root", "root": true, "input": {}, "outputs": [{ "stateId": "end" }] },
                { "id": "end", "inputActions": [{ "type": "Slow" }, send("never")] }
            ]
        }));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let err = test
            .engine
            .process_input(&flow, TEST_USER, UserInput::text("go"), &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(!test.lock.is_held(&lock_key(flow.id(), TEST_USER)));
        assert_eq!(test.sessions.writes(), vec![]);
        assert!(test.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let test = TestEngine::new().build();
        let flow = ping_flow();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = test
            .engine
            .process_input(&flow, TEST_USER, UserInput::text("Ping!"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(test.sessions.calls().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_pass_releases_lock() {
        let test = TestEngine::new()
            .handler(SlowAction::new("Slow", Duration::from_secs(30)))
            .build();
        let flow = Arc::new(flow_from(json!({
            "id": "slow",
            "states": [
                { "id": "root", "root": true, "input": {}, "outputs": [{ "stateId": "end" }] },
                { "id": "end", "inputActions": [{ "type": "Slow" }] }
            ]
        })));
        let key = lock_key(flow.id(), TEST_USER);

        let task = {
            let engine = test.engine.clone();
            let flow = flow.clone();
            tokio::spawn(async move {
                engine
                    .process_input(
                        &flow,
                        TEST_USER,
                        UserInput::text("go"),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        while !test.lock.is_held(&key) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        for _ in 0..100 {
            if !test.lock.is_held(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!test.lock.is_held(&key));
    }
}
