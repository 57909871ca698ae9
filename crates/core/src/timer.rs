//! Cancellable delays.
//!
//! Every wait in the runtime and supervisor (idle interval, claim backoff,
//! restart delay, monitor tick) goes through [`sleep_or_cancel`], so shutdown
//! never waits out a sleep and tests can drive time with tokio's paused clock.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `true` if the full delay elapsed, `false` if it was cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn full_delay_elapses_without_cancel() {
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(sleep_or_cancel(&token, Duration::from_secs(30)).await);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_the_delay_short() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            child.cancel();
        });

        let started = tokio::time::Instant::now();
        assert!(!sleep_or_cancel(&token, Duration::from_secs(3600)).await);
        assert!(started.elapsed() < Duration::from_secs(3600));
    }
}
