use std::time::Duration;

const LADDER_SECS: [u64; 11] = [1, 1, 1, 2, 2, 2, 3, 4, 5, 10, 15];

/// Once the ladder is exhausted, retry this often forever.
pub const RECONNECT_PERIOD: Duration = Duration::from_secs(30);

/// Delays between reconnection attempts after a line is lost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectSchedule {
    attempt: usize,
}

impl ReconnectSchedule {
    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = LADDER_SECS
            .get(self.attempt)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or(RECONNECT_PERIOD);
        self.attempt += 1;
        delay
    }

    /// How many delays have been handed out since the last reset.
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Start over. Only done after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
