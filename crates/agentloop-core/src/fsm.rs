//! The finite-state machine driving the conversation: states, transition
//! table, and next-state candidate enumeration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One node of the conversation FSM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub next_states: Vec<String>,
}

/// The full transition table for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMachine {
    #[serde(default)]
    pub states: Vec<State>,
    #[serde(default)]
    pub free_states: Vec<String>,
    #[serde(default)]
    pub entry_state: Option<String>,
}

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("state machine references unknown state '{0}'")]
    UnknownState(String),
    #[error("duplicate state name '{0}'")]
    DuplicateState(String),
}

impl StateMachine {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Validate every cross-reference named in §3: `next_states`, `free_states`,
    /// and `entry_state` must all resolve to a declared state, and names must
    /// be unique.
    pub fn validate(&self) -> Result<(), FsmError> {
        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.name.as_str()) {
                return Err(FsmError::DuplicateState(state.name.clone()));
            }
        }
        for state in &self.states {
            for next in &state.next_states {
                if !seen.contains(next.as_str()) {
                    return Err(FsmError::UnknownState(next.clone()));
                }
            }
        }
        for free in &self.free_states {
            if !seen.contains(free.as_str()) {
                return Err(FsmError::UnknownState(free.clone()));
            }
        }
        if let Some(entry) = &self.entry_state {
            if !seen.contains(entry.as_str()) {
                return Err(FsmError::UnknownState(entry.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn entry(&self) -> Option<&State> {
        match &self.entry_state {
            Some(name) => self.get(name),
            None => self.states.first(),
        }
    }

    /// §4.5: enumerate the ordered, de-duplicated candidate states reachable
    /// from `current_name`.
    pub fn next_candidates(&self, current_name: &str) -> Vec<State> {
        if current_name.is_empty() || self.get(current_name).is_none() {
            let mut ordered: Vec<State> = Vec::new();
            let mut seen = HashSet::new();
            for free_name in &self.free_states {
                if let Some(state) = self.get(free_name) {
                    if seen.insert(state.name.clone()) {
                        ordered.push(state.clone());
                    }
                }
            }
            for state in &self.states {
                if seen.insert(state.name.clone()) {
                    ordered.push(state.clone());
                }
            }
            return ordered;
        }

        let current = self.get(current_name).expect("checked above");
        let mut ordered: Vec<State> = Vec::new();
        let mut seen = HashSet::new();
        for name in &current.next_states {
            if let Some(state) = self.get(name) {
                if seen.insert(state.name.clone()) {
                    ordered.push(state.clone());
                }
            }
        }
        for name in &self.free_states {
            if let Some(state) = self.get(name) {
                if seen.insert(state.name.clone()) {
                    ordered.push(state.clone());
                }
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StateMachine {
        StateMachine {
            states: vec![
                State {
                    name: "greeting".into(),
                    scenario: "start of conversation".into(),
                    instruction: "greet the user".into(),
                    next_states: vec!["booking".into()],
                },
                State {
                    name: "booking".into(),
                    scenario: "user wants to book".into(),
                    instruction: "collect booking details".into(),
                    next_states: vec![],
                },
                State {
                    name: "fallback".into(),
                    scenario: "anything unexpected".into(),
                    instruction: "ask a clarifying question".into(),
                    next_states: vec![],
                },
            ],
            free_states: vec!["fallback".into()],
            entry_state: Some("greeting".into()),
        }
    }

    #[test]
    fn validate_accepts_well_formed_machine() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_next_state() {
        let mut fsm = sample();
        fsm.states[1].next_states.push("missing".into());
        assert!(matches!(fsm.validate(), Err(FsmError::UnknownState(_))));
    }

    #[test]
    fn next_candidates_for_empty_current_returns_free_then_all() {
        let fsm = sample();
        let candidates = fsm.next_candidates("");
        let names: Vec<&str> = candidates.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fallback", "greeting", "booking"]);
    }

    #[test]
    fn next_candidates_unions_next_states_and_free_states() {
        let fsm = sample();
        let candidates = fsm.next_candidates("greeting");
        let names: Vec<&str> = candidates.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["booking", "fallback"]);
    }

    #[test]
    fn next_candidates_dedupes_when_next_state_is_also_free() {
        let mut fsm = sample();
        fsm.states[0].next_states.push("fallback".into());
        let candidates = fsm.next_candidates("greeting");
        let names: Vec<&str> = candidates.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["booking", "fallback"]);
    }

    #[test]
    fn next_candidates_for_unknown_current_falls_back_to_empty_rule() {
        let fsm = sample();
        let candidates = fsm.next_candidates("nonexistent");
        assert_eq!(candidates.len(), 3);
    }
}
