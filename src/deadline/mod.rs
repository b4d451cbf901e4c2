use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {}ms elapsed", .after.as_millis())]
pub struct TimeoutError {
    pub after: Duration,
}

// Resolves with whichever settles first: `operation` or a timer of `duration`.
pub async fn race_with_timeout<F>(operation: F, duration: Duration) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(duration, operation)
        .await
        .map_err(|_| TimeoutError { after: duration })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn operation_wins_when_it_settles_first() {
        let out = race_with_timeout(async { 7 }, Duration::from_secs(1)).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_wins_against_a_slow_operation() {
        let slow = tokio::time::sleep(Duration::from_secs(10));
        let err = race_with_timeout(slow, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err.after, Duration::from_millis(250));
        assert_eq!(err.to_string(), "deadline of 250ms elapsed");
    }

    #[tokio::test(start_paused = true)]
    async fn pending_forever_still_times_out() {
        let res = race_with_timeout(std::future::pending::<()>(), Duration::from_secs(5)).await;
        assert!(res.is_err());
    }
}
