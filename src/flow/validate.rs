//! Flow validation

use super::{Comparison, Flow, FlowError, State};
use regex::Regex;
use std::collections::HashMap;

/// Compiled `matches` patterns, keyed by their source text
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    compiled: HashMap<String, Regex>,
}

impl PatternSet {
    fn insert(&mut self, pattern: &str) -> Result<(), regex::Error> {
        if !self.compiled.contains_key(pattern) {
            self.compiled.insert(pattern.to_string(), Regex::new(pattern)?);
        }
        Ok(())
    }

    pub fn get(&self, pattern: &str) -> Option<&Regex> {
        self.compiled.get(pattern)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Test `value` against `pattern`, compiling it only when it is not in
    /// the set. An invalid pattern never matches.
    pub fn is_match(&self, pattern: &str, value: &str) -> bool {
        if let Some(regex) = self.get(pattern) {
            return regex.is_match(value);
        }
        match Regex::new(pattern) {
            Ok(regex) => regex.is_match(value),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Invalid condition pattern");
                false
            }
        }
    }
}

/// A flow that passed validation
///
/// Holds a state index so lookups during the walk are O(1), and every
/// condition pattern compiled once.
#[derive(Debug, Clone)]
pub struct ValidatedFlow {
    flow: Flow,
    index: HashMap<String, usize>,
    root: usize,
    patterns: PatternSet,
}

impl ValidatedFlow {
    pub fn id(&self) -> &str {
        &self.flow.id
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn states(&self) -> &[State] {
        &self.flow.states
    }

    pub fn root(&self) -> &State {
        &self.flow.states[self.root]
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.index.get(id).map(|&i| &self.flow.states[i])
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.flow.variables
    }
}

impl Flow {
    /// Check the structural invariants of the flow
    ///
    /// Rejects flows without exactly one root, roots that do not wait for
    /// input, dangling transitions, invalid patterns and cycles made only of
    /// states that fall through without input.
    pub fn validate(self) -> Result<ValidatedFlow, FlowError> {
        if self.id.trim().is_empty() {
            return Err(FlowError::malformed(&self.id, "the flow id is required"));
        }
        if self.states.is_empty() {
            return Err(FlowError::malformed(&self.id, "the flow must have states"));
        }

        let mut index = HashMap::with_capacity(self.states.len());
        for (i, state) in self.states.iter().enumerate() {
            if state.id.trim().is_empty() {
                return Err(FlowError::malformed(
                    &self.id,
                    format!("state #{i} has no id"),
                ));
            }
            if index.insert(state.id.clone(), i).is_some() {
                return Err(FlowError::malformed(
                    &self.id,
                    format!("duplicate state id '{}'", state.id),
                ));
            }
        }

        let roots: Vec<usize> = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, state)| state.root)
            .map(|(i, _)| i)
            .collect();
        let &[root] = roots.as_slice() else {
            return Err(FlowError::malformed(
                &self.id,
                "the flow must have one root state",
            ));
        };
        if !self.states[root].awaits_input() {
            return Err(FlowError::malformed(
                &self.id,
                "the root state must expect an input",
            ));
        }

        let mut patterns = PatternSet::default();
        for state in &self.states {
            check_state(&self.id, state, &index, &mut patterns)?;
        }

        if let Some(state_id) = find_fall_through_cycle(&self.states, &index) {
            return Err(FlowError::malformed(
                &self.id,
                format!(
                    "state '{state_id}' is part of a cycle of states that never wait for input"
                ),
            ));
        }

        tracing::debug!(
            flow_id = %self.id,
            states = self.states.len(),
            patterns = patterns.len(),
            "Flow validated"
        );
        Ok(ValidatedFlow {
            flow: self,
            index,
            root,
            patterns,
        })
    }
}

fn check_state(
    flow_id: &str,
    state: &State,
    index: &HashMap<String, usize>,
    patterns: &mut PatternSet,
) -> Result<(), FlowError> {
    for output in &state.outputs {
        if !index.contains_key(&output.state_id) {
            return Err(FlowError::malformed(
                flow_id,
                format!(
                    "state '{}' has an output to unknown state '{}'",
                    state.id, output.state_id
                ),
            ));
        }
    }

    let actions = state.input_actions.iter().chain(&state.output_actions);
    for action in actions.clone() {
        if action.action_type.trim().is_empty() {
            return Err(FlowError::malformed(
                flow_id,
                format!("state '{}' has an action without type", state.id),
            ));
        }
    }

    let conditions = state
        .outputs
        .iter()
        .flat_map(|output| &output.conditions)
        .chain(actions.flat_map(|action| &action.conditions));
    for condition in conditions {
        if condition.comparison != Comparison::Matches {
            continue;
        }
        for pattern in &condition.values {
            if let Err(e) = patterns.insert(pattern) {
                return Err(FlowError::malformed(
                    flow_id,
                    format!("state '{}' has an invalid pattern '{pattern}': {e}", state.id),
                ));
            }
        }
    }

    Ok(())
}

/// Depth-first search over the states that fall through without input.
/// Returns the id of a state on a cycle, if any.
fn find_fall_through_cycle(
    states: &[State],
    index: &HashMap<String, usize>,
) -> Option<String> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; states.len()];

    for start in 0..states.len() {
        if states[start].awaits_input() || marks[start] != Mark::Unvisited {
            continue;
        }

        marks[start] = Mark::InProgress;
        let mut stack = vec![(start, 0usize)];

        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            let outputs = &states[node].outputs;
            if cursor == outputs.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            frame.1 += 1;

            let Some(&target) = index.get(&outputs[cursor].state_id) else {
                continue;
            };
            if states[target].awaits_input() {
                continue;
            }
            match marks[target] {
                Mark::InProgress => return Some(states[target].id.clone()),
                Mark::Unvisited => {
                    marks[target] = Mark::InProgress;
                    stack.push((target, 0));
                }
                Mark::Done => {}
            }
        }
    }

    None
}
