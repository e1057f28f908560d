use std::future::pending;
use std::ops::Deref;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::{Result, Status};

/// A relative time budget for a call, as configured by a caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    None,
    Duration(Duration),
}

impl Deref for Timeout {
    type Target = Duration;
    fn deref(&self) -> &Self::Target {
        match self {
            Timeout::None => &Duration::ZERO,
            Timeout::Duration(t) => t,
        }
    }
}

// Timeouts travel as signed nanoseconds.
const MAX_TIMEOUT: Duration = Duration::from_nanos(i64::MAX as u64);

impl From<Option<Duration>> for Timeout {
    fn from(value: Option<Duration>) -> Self {
        value.map_or(Timeout::None, Timeout::from)
    }
}

impl From<Duration> for Timeout {
    fn from(t: Duration) -> Self {
        if t.is_zero() {
            return Timeout::None;
        }
        Timeout::Duration(t.min(MAX_TIMEOUT))
    }
}

impl Timeout {
    pub fn from_nanos(nanos: i64) -> Self {
        Duration::from_nanos(nanos.max(0) as u64).into()
    }

    pub fn as_nanos(&self) -> i64 {
        self.deref().as_nanos().min(i64::MAX as u128) as i64
    }

    /// The absolute point in time this budget expires at, counting from `now`.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        match self {
            Timeout::None => None,
            Timeout::Duration(t) => now.checked_add(*t),
        }
    }

    /// The budget left until `deadline`.
    ///
    /// An expired deadline still yields a (minimal) timeout so that it is not
    /// mistaken for "no deadline" on the other side.
    pub fn until(deadline: Option<Instant>) -> Self {
        match deadline {
            None => Timeout::None,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                Timeout::Duration(left.clamp(Duration::from_nanos(1), MAX_TIMEOUT))
            }
        }
    }
}

/// Resolves with `DeadlineExceeded` once `deadline` passes, never without one.
pub(crate) async fn expire_at(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
    Err(Status::timeout())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_means_no_timeout() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::None);
        assert_eq!(Timeout::from_nanos(0), Timeout::None);
        assert_eq!(Timeout::from_nanos(-5), Timeout::None);
        assert_eq!(Timeout::None.as_nanos(), 0);
    }

    #[test]
    fn nanos_are_clamped() {
        let t = Timeout::from(Duration::from_secs(u64::MAX));
        assert_eq!(t.as_nanos(), i64::MAX);
        assert_eq!(Timeout::from_nanos(1_500).as_nanos(), 1_500);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_keeps_a_budget() {
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            Timeout::until(Some(deadline)),
            Timeout::Duration(Duration::from_nanos(1))
        );
        assert_eq!(Timeout::until(None), Timeout::None);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_at_fails_with_deadline_exceeded() {
        let deadline = Timeout::from(Duration::from_millis(50)).deadline_from(Instant::now());
        let status = expire_at(deadline).await.unwrap_err();
        assert_eq!(status.code(), crate::Code::DeadlineExceeded);
    }
}
