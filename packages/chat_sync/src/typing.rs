//! Per-conversation "peer is typing" flags with automatic decay.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct TypingState {
    is_typing: bool,
    set_at: Instant,
}

#[derive(Debug)]
pub struct TypingTracker {
    states: HashMap<String, TypingState>,
    decay: Duration,
}

impl TypingTracker {
    pub fn new(decay: Duration) -> Self {
        Self {
            states: HashMap::new(),
            decay,
        }
    }

    pub fn set_typing(&mut self, conversation_id: &str, is_typing: bool) {
        self.set_typing_at(conversation_id, is_typing, Instant::now());
    }

    pub fn set_typing_at(&mut self, conversation_id: &str, is_typing: bool, now: Instant) {
        if is_typing {
            self.states.insert(
                conversation_id.to_string(),
                TypingState {
                    is_typing,
                    set_at: now,
                },
            );
        } else {
            self.states.remove(conversation_id);
        }
    }

    pub fn is_typing(&self, conversation_id: &str) -> bool {
        self.is_typing_at(conversation_id, Instant::now())
    }

    /// A flag older than the decay interval reads as cleared even before
    /// `expire_due` has swept it.
    pub fn is_typing_at(&self, conversation_id: &str, now: Instant) -> bool {
        self.states
            .get(conversation_id)
            .is_some_and(|s| s.is_typing && now < s.set_at + self.decay)
    }

    /// A real message arrived: the reply supersedes the indicator.
    pub fn clear(&mut self, conversation_id: &str) {
        self.states.remove(conversation_id);
    }

    pub fn clear_all(&mut self) {
        self.states.clear();
    }

    /// Earliest instant at which a flag decays.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.states.values().map(|s| s.set_at + self.decay).min()
    }

    /// Drop decayed flags and return the conversations they belonged to.
    pub fn expire_due(&mut self, now: Instant) -> Vec<String> {
        let decay = self.decay;
        let expired: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| now >= s.set_at + decay)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.states.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECAY: Duration = Duration::from_secs(10);

    #[test]
    fn test_flag_is_scoped_per_conversation() {
        let now = Instant::now();
        let mut t = TypingTracker::new(DECAY);
        t.set_typing_at("a", true, now);

        assert!(t.is_typing_at("a", now));
        assert!(!t.is_typing_at("b", now));
    }

    #[test]
    fn test_flag_decays_after_interval() {
        let now = Instant::now();
        let mut t = TypingTracker::new(DECAY);
        t.set_typing_at("a", true, now);

        assert!(t.is_typing_at("a", now + Duration::from_secs(9)));
        assert!(!t.is_typing_at("a", now + DECAY));
    }

    #[test]
    fn test_refresh_extends_deadline() {
        let now = Instant::now();
        let mut t = TypingTracker::new(DECAY);
        t.set_typing_at("a", true, now);
        t.set_typing_at("a", true, now + Duration::from_secs(8));

        assert_eq!(t.next_deadline(), Some(now + Duration::from_secs(18)));
        assert!(t.is_typing_at("a", now + Duration::from_secs(15)));
    }

    #[test]
    fn test_explicit_false_and_clear() {
        let now = Instant::now();
        let mut t = TypingTracker::new(DECAY);
        t.set_typing_at("a", true, now);
        t.set_typing_at("b", true, now);

        t.set_typing_at("a", false, now);
        t.clear("b");

        assert!(!t.is_typing_at("a", now));
        assert!(!t.is_typing_at("b", now));
        assert!(t.next_deadline().is_none());
    }

    #[test]
    fn test_expire_due_sweeps_only_decayed() {
        let now = Instant::now();
        let mut t = TypingTracker::new(DECAY);
        t.set_typing_at("old", true, now);
        t.set_typing_at("new", true, now + Duration::from_secs(5));

        let expired = t.expire_due(now + DECAY);
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(t.is_typing_at("new", now + DECAY));
        assert_eq!(t.next_deadline(), Some(now + Duration::from_secs(15)));
    }
}
