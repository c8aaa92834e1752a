use std::time::Duration;

/// Waits between connection attempts to a freshly spawned runtime process.
///
/// For `attempts` tries it yields `attempts - 1` delays, starting at `first`
/// and doubling up to `cap`. Running out of delays means the last attempt
/// has been made.
#[derive(Debug, Clone, Copy)]
pub struct ConnectDelays {
    next: Duration,
    cap: Duration,
    remaining: u32,
}

impl ConnectDelays {
    #[must_use]
    pub fn new(attempts: u32, first: Duration, cap: Duration) -> Self {
        Self {
            next: first.min(cap),
            cap,
            remaining: attempts.saturating_sub(1),
        }
    }
}

impl Iterator for ConnectDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.cap);
        Some(delay)
    }
}
