// Reconnect delay schedules.
use std::sync::Arc;
use std::time::Duration;

pub(crate) const STREAM_DELAYS_MS: [u64; 5] = [200, 500, 1000, 2000, 5000];
pub(crate) const SOCKET_DELAYS_MS: [u64; 7] = [200, 300, 500, 1000, 1200, 1500, 2000];

/// Fixed ordered list of delays, clamped at the last entry. No jitter.
///
/// ```
/// use std::time::Duration;
/// use stratus_realtime::Backoff;
///
/// let backoff = Backoff::stream();
/// assert_eq!(backoff.next(0), Duration::from_millis(200));
/// assert_eq!(backoff.next(99), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    delays: Arc<[Duration]>,
}

impl Backoff {
    /// An empty list falls back to a single zero delay.
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        let mut delays: Vec<Duration> = delays.into_iter().collect();
        if delays.is_empty() {
            delays.push(Duration::ZERO);
        }
        Self {
            delays: delays.into(),
        }
    }

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_millis))
    }

    pub fn stream() -> Self {
        Self::from_millis(&STREAM_DELAYS_MS)
    }

    pub fn socket() -> Self {
        Self::from_millis(&SOCKET_DELAYS_MS)
    }

    pub fn next(&self, attempt: usize) -> Duration {
        let index = attempt.min(self.delays.len() - 1);
        self.delays[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_schedule_clamps_at_last() {
        let backoff = Backoff::stream();
        let observed: Vec<u64> = (0..7).map(|n| backoff.next(n).as_millis() as u64).collect();
        assert_eq!(observed, vec![200, 500, 1000, 2000, 5000, 5000, 5000]);
    }

    #[test]
    fn socket_schedule_is_independent() {
        let backoff = Backoff::socket();
        assert_eq!(backoff.next(1), Duration::from_millis(300));
        assert_eq!(backoff.next(6), Duration::from_millis(2000));
        assert_eq!(backoff.next(50), Duration::from_millis(2000));
    }

    #[test]
    fn empty_schedule_retries_immediately() {
        let backoff = Backoff::new(Vec::new());
        assert_eq!(backoff.next(3), Duration::ZERO);
    }
}
