use chat_protocol::{ConversationId, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct TypingTracker {
    last: Mutex<HashMap<(UserId, ConversationId), Instant>>,
    debounce: Duration,
}

impl TypingTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Register a typing update. Returns true if it should be broadcast.
    /// A stop always passes and reopens the window for the next start.
    pub fn typing(&self, user_id: &UserId, conversation_id: &ConversationId, is_typing: bool) -> bool {
        let mut guard = self.last.lock();
        let key = (user_id.clone(), *conversation_id);
        if !is_typing {
            guard.remove(&key);
            return true;
        }
        let now = Instant::now();
        // drop expired windows, including starts that never saw a stop
        guard.retain(|_, prev| now.duration_since(*prev) < self.debounce);
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, now);
        true
    }

    pub fn tracked(&self) -> usize {
        self.last.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_logic() {
        let tracker = TypingTracker::new(Duration::from_secs(2));
        let user = UserId::parse("alice").unwrap();
        let conv = ConversationId::new();
        assert!(tracker.typing(&user, &conv, true));
        assert!(!tracker.typing(&user, &conv, true));
        assert!(tracker.typing(&user, &ConversationId::new(), true));
    }

    #[test]
    fn stop_always_passes_and_resets() {
        let tracker = TypingTracker::new(Duration::from_secs(2));
        let user = UserId::parse("alice").unwrap();
        let conv = ConversationId::new();
        assert!(tracker.typing(&user, &conv, true));
        assert!(tracker.typing(&user, &conv, false));
        assert!(tracker.typing(&user, &conv, false));
        assert!(tracker.typing(&user, &conv, true));
    }

    #[test]
    fn abandoned_windows_are_pruned() {
        let tracker = TypingTracker::new(Duration::from_millis(200));
        let conv = ConversationId::new();
        for name in ["a", "b", "c"] {
            assert!(tracker.typing(&UserId::parse(name).unwrap(), &conv, true));
        }
        assert_eq!(tracker.tracked(), 3);
        std::thread::sleep(Duration::from_millis(300));
        assert!(tracker.typing(&UserId::parse("d").unwrap(), &conv, true));
        assert_eq!(tracker.tracked(), 1);
    }

    #[test]
    fn zero_window_never_suppresses() {
        let tracker = TypingTracker::new(Duration::ZERO);
        let user = UserId::parse("bob").unwrap();
        let conv = ConversationId::new();
        assert!(tracker.typing(&user, &conv, true));
        assert!(tracker.typing(&user, &conv, true));
    }
}
