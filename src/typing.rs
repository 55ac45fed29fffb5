use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::model::UserId;

struct TypingEntry {
    user_id: UserId,
    generation: u64,
    expiry: AbortHandle,
}

#[derive(Default)]
struct TypingState {
    entries: Vec<TypingEntry>,
    next_generation: u64,
}

/// Users currently typing in the active room. Each user holds an expiry
/// timer that is re-armed by every typing signal and cancelled by an
/// explicit stop.
#[derive(Clone)]
pub struct TypingTracker {
    expiry: Duration,
    state: Arc<RwLock<TypingState>>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        TypingTracker {
            expiry,
            state: Arc::new(RwLock::new(TypingState::default())),
        }
    }

    pub async fn observe(&self, user_id: &str) {
        let mut state = self.state.write().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        let expiry = self.spawn_expiry(user_id.to_string(), generation);

        if let Some(entry) = state.entries.iter_mut().find(|e| e.user_id == user_id) {
            entry.expiry.abort();
            entry.expiry = expiry;
            entry.generation = generation;
        } else {
            state.entries.push(TypingEntry {
                user_id: user_id.to_string(),
                generation,
                expiry,
            });
        }
    }

    pub async fn clear(&self, user_id: &str) {
        let mut state = self.state.write().await;
        state.entries.retain(|entry| {
            let keep = entry.user_id != user_id;
            if !keep {
                entry.expiry.abort();
            }
            keep
        });
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        for entry in state.entries.drain(..) {
            entry.expiry.abort();
        }
    }

    /// Typing users in the order they started typing.
    pub async fn users(&self) -> Vec<UserId> {
        let state = self.state.read().await;
        state.entries.iter().map(|e| e.user_id.clone()).collect()
    }

    fn spawn_expiry(&self, user_id: UserId, generation: u64) -> AbortHandle {
        let state = Arc::clone(&self.state);
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let mut state = state.write().await;
            // A refresh may have raced the abort; only the newest timer may expire the entry.
            state
                .entries
                .retain(|e| !(e.user_id == user_id && e.generation == generation));
            trace!("Typing indicator for {user_id} expired");
        })
        .abort_handle()
    }
}

/// Rate limit for the local user's outgoing typing signals.
#[derive(Debug)]
pub struct TypingThrottle {
    window: Duration,
    last_start: Option<Instant>,
}

impl TypingThrottle {
    pub fn new(window: Duration) -> Self {
        TypingThrottle {
            window,
            last_start: None,
        }
    }

    /// True when a start signal should go out now.
    pub fn should_start(&mut self, now: Instant) -> bool {
        match self.last_start {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last_start = Some(now);
                true
            }
        }
    }

    /// True when a start was signalled and not yet stopped.
    pub fn should_stop(&mut self) -> bool {
        self.last_start.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_secs(4);

    #[tokio::test(start_paused = true)]
    async fn entry_expires_without_refresh() {
        let tracker = TypingTracker::new(EXPIRY);
        tracker.observe("ada").await;
        assert_eq!(tracker.users().await, ["ada"]);

        tokio::time::sleep(EXPIRY + Duration::from_millis(10)).await;
        assert!(tracker.users().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_rearms_the_timer() {
        let tracker = TypingTracker::new(EXPIRY);
        tracker.observe("ada").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        tracker.observe("ada").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(tracker.users().await, ["ada"]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.users().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn order_follows_first_signal() {
        let tracker = TypingTracker::new(EXPIRY);
        tracker.observe("ada").await;
        tracker.observe("grace").await;
        tracker.observe("ada").await;
        assert_eq!(tracker.users().await, ["ada", "grace"]);

        tracker.clear("ada").await;
        assert_eq!(tracker.users().await, ["grace"]);

        tracker.reset().await;
        assert!(tracker.users().await.is_empty());
    }

    #[test]
    fn throttle_allows_one_start_per_window() {
        let mut throttle = TypingThrottle::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(throttle.should_start(t0));
        assert!(!throttle.should_start(t0 + Duration::from_millis(500)));
        assert!(throttle.should_start(t0 + Duration::from_secs(2)));

        assert!(throttle.should_stop());
        assert!(!throttle.should_stop());
        assert!(throttle.should_start(t0 + Duration::from_millis(2100)));
    }
}
