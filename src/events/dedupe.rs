use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Window in which identical exposures are logged once.
pub(crate) const DEDUPE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on remembered keys. Reaching it clears the set early.
const MAX_KEYS: usize = 100_000;

/// Remembers recently logged exposure keys.
pub(crate) struct ExposureDedupe {
    window: Duration,
    state: Mutex<DedupeState>,
}

struct DedupeState {
    seen: HashMap<String, Instant>,
    last_purge: Instant,
}

impl ExposureDedupe {
    pub fn new(window: Duration) -> ExposureDedupe {
        ExposureDedupe {
            window,
            state: Mutex::new(DedupeState {
                seen: HashMap::new(),
                last_purge: Instant::now(),
            }),
        }
    }

    /// Returns `true` when `key` was not logged within the window, and records it.
    pub fn should_log(&self, key: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return true;
        };
        let now = Instant::now();

        if now.duration_since(state.last_purge) >= self.window || state.seen.len() >= MAX_KEYS {
            let window = self.window;
            state.seen.retain(|_, logged_at| now.duration_since(*logged_at) < window);
            if state.seen.len() >= MAX_KEYS {
                state.seen.clear();
            }
            state.last_purge = now;
        }

        let recent = state
            .seen
            .get(key)
            .is_some_and(|logged_at| now.duration_since(*logged_at) < self.window);
        if recent {
            return false;
        }
        state.seen.insert(key.to_owned(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ExposureDedupe;

    #[test]
    fn suppresses_repeats_within_window() {
        let dedupe = ExposureDedupe::new(Duration::from_secs(60));
        assert!(dedupe.should_log("gate|rule|u1"));
        assert!(!dedupe.should_log("gate|rule|u1"));
        assert!(dedupe.should_log("gate|rule|u2"));
    }

    #[test]
    fn logs_again_after_window() {
        let dedupe = ExposureDedupe::new(Duration::from_millis(10));
        assert!(dedupe.should_log("k"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(dedupe.should_log("k"));
    }
}
