use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

/// Writes from different hosts closer than this are a collision.
pub const COLLISION_WINDOW: Duration = Duration::from_millis(1000);

/// Remembers who wrote to a line recently.
#[derive(Debug)]
pub struct RecentWriters {
    window: Duration,
    last_write: HashMap<String, Instant>,
}

impl Default for RecentWriters {
    fn default() -> Self {
        Self::new(COLLISION_WINDOW)
    }
}

impl RecentWriters {
    /// Track writes within `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_write: HashMap::new(),
        }
    }

    /// Record a write by `host` at `now`.
    ///
    /// Returns every host which wrote within the window (sorted),
    /// if that is more than one.
    pub fn record(&mut self, host: &str, now: Instant) -> Option<Vec<String>> {
        let window = self.window;
        self.last_write
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        self.last_write.insert(host.into(), now);

        if self.last_write.len() < 2 {
            return None;
        }

        let mut hosts: Vec<String> = self.last_write.keys().cloned().collect();
        hosts.sort();
        Some(hosts)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn single_writer_never_collides() {
        let mut writers = RecentWriters::default();
        let start = Instant::now();

        for ms in [0, 10, 20, 500] {
            assert_eq!(writers.record("a", start + Duration::from_millis(ms)), None);
        }
    }

    #[test]
    fn two_then_three_writers() {
        let mut writers = RecentWriters::default();
        let start = Instant::now();

        assert_eq!(writers.record("b", start), None);
        assert_eq!(
            writers.record("a", start + Duration::from_millis(100)),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            writers.record("c", start + Duration::from_millis(200)),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn window_expires() {
        let mut writers = RecentWriters::default();
        let start = Instant::now();

        writers.record("a", start);
        writers.record("b", start + Duration::from_millis(10));

        assert_eq!(
            writers.record("c", start + Duration::from_millis(1500)),
            None
        );
    }
}
