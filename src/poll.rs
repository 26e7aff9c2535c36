//! Sleep-then-retry bounded by both an attempt ceiling and a deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub interval: Duration,
    pub attempts: u32,
}

impl PollSpec {
    /// Enough attempts at `interval` to cover `timeout` (at least one).
    pub fn covering(timeout: Duration, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let attempts = timeout.as_millis().div_ceil(interval.as_millis()).max(1);
        Self {
            interval,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }
    }

    /// Total time the poll may take.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Call `probe` until it yields `Some`, sleeping `interval` after every miss.
///
/// `probe` gets the attempt number and the time left before the deadline
/// (`budget()` from the first call). A probe still pending at the deadline is
/// dropped, so slow probes cannot stretch the poll past its budget. Gives up
/// with `None` after `attempts` probes or at the deadline, whichever is first.
pub async fn poll_until<T, F, Fut>(spec: PollSpec, mut probe: F) -> Option<T>
where
    F: FnMut(u32, Duration) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + spec.budget();
    for attempt in 1..=spec.attempts {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, probe(attempt, remaining)).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(_) => {
                tracing::debug!(attempt, "probe still pending at deadline");
                break;
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tracing::trace!(attempt, of = spec.attempts, "not yet, retrying");
        tokio::time::sleep(spec.interval.min(remaining)).await;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_rounds_up() {
        let spec = PollSpec::covering(Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(spec.attempts, 60);
        let spec = PollSpec::covering(Duration::from_millis(2500), Duration::from_secs(1));
        assert_eq!(spec.attempts, 3);
        let spec = PollSpec::covering(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(spec.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_hit() {
        let spec = PollSpec {
            interval: Duration::from_secs(1),
            attempts: 10,
        };
        let start = Instant::now();
        let hit = poll_until(spec, |n, _| std::future::ready((n == 4).then_some(n))).await;
        assert_eq!(hit, Some(4));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ceiling_without_busy_looping() {
        let spec = PollSpec {
            interval: Duration::from_secs(1),
            attempts: 5,
        };
        let mut calls = 0;
        let start = Instant::now();
        let hit: Option<()> = poll_until(spec, |_, _| {
            calls += 1;
            std::future::ready(None)
        })
        .await;
        assert_eq!(hit, None);
        assert_eq!(calls, 5);
        assert_eq!(start.elapsed(), spec.budget());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probes_cannot_outlast_the_budget() {
        let spec = PollSpec {
            interval: Duration::from_secs(1),
            attempts: 30,
        };
        let mut offered = Vec::new();
        let start = Instant::now();
        let hit: Option<()> = poll_until(spec, |_, remaining| {
            offered.push(remaining);
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                None
            }
        })
        .await;
        assert_eq!(hit, None);
        assert_eq!(start.elapsed(), spec.budget());
        assert_eq!(offered, vec![Duration::from_secs(30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_time_shrinks_between_attempts() {
        let spec = PollSpec {
            interval: Duration::from_secs(2),
            attempts: 3,
        };
        let mut offered = Vec::new();
        let _: Option<()> = poll_until(spec, |_, remaining| {
            offered.push(remaining);
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                None
            }
        })
        .await;
        // 6s budget; each attempt burns 1s probing and 2s sleeping.
        assert_eq!(
            offered,
            vec![Duration::from_secs(6), Duration::from_secs(3)]
        );
    }
}
