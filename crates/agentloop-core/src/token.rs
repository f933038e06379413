//! Process-wide, session-keyed token accounting (§3 TokenUsage, §4.1,
//! §9: the "two components computing different keys" bug this guards
//! against). The counter is a single process-global registry; callers
//! must be careful to read back totals under the exact session id they
//! wrote under.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::TokenUsage;

/// Keyed registry of per-session token totals. Cheap to clone (an `Arc`
/// around this is the usual way to share it); internally mutex-guarded
/// so concurrent turns never race on the same map (§5).
#[derive(Default)]
pub struct TokenCounter {
    sessions: Mutex<HashMap<String, TokenUsage>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one LLM call's usage under `session_id`, creating the
    /// session's entry if this is its first call.
    pub fn add(&self, session_id: &str, input_tokens: u64, output_tokens: u64) {
        let mut sessions = self.sessions.lock().expect("token counter mutex poisoned");
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.total_input_tokens += input_tokens;
        entry.total_output_tokens += output_tokens;
        entry.call_count += 1;
    }

    /// Current totals for `session_id`, or a zeroed `TokenUsage` if no
    /// call has been recorded under it yet.
    pub fn get(&self, session_id: &str) -> TokenUsage {
        let sessions = self.sessions.lock().expect("token counter mutex poisoned");
        sessions.get(session_id).copied().unwrap_or_default()
    }

    /// Remove a session's accounting. The orchestrator calls this once a
    /// turn's totals have been read into the HTTP response, so the map
    /// doesn't grow unboundedly across many turns.
    pub fn clear(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("token counter mutex poisoned");
        sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_accumulates_under_the_same_session() {
        let counter = TokenCounter::new();
        counter.add("a:1", 10, 20);
        counter.add("a:1", 5, 5);
        let usage = counter.get("a:1");
        assert_eq!(usage.total_input_tokens, 15);
        assert_eq!(usage.total_output_tokens, 25);
        assert_eq!(usage.call_count, 2);
    }

    #[test]
    fn sessions_do_not_interfere() {
        let counter = TokenCounter::new();
        counter.add("a:1", 10, 10);
        counter.add("b:1", 1, 1);
        assert_eq!(counter.get("a:1").total_input_tokens, 10);
        assert_eq!(counter.get("b:1").total_input_tokens, 1);
    }

    #[tokio::test]
    async fn concurrent_turns_do_not_corrupt_each_others_totals() {
        let counter = Arc::new(TokenCounter::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let session = format!("agent:{i}");
                for _ in 0..50 {
                    counter.add(&session, 1, 1);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for i in 0..8 {
            let usage = counter.get(&format!("agent:{i}"));
            assert_eq!(usage.call_count, 50);
            assert_eq!(usage.total_input_tokens, 50);
        }
    }
}
