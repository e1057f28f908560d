use tokio::sync::Semaphore;

/// Elements the remote consumer is ready to receive on one stream.
///
/// Each permit stands for one element. Permits are granted by `Demand`
/// frames and consumed before an element is pulled from its source.
pub struct Credit(Semaphore);

impl Default for Credit {
    fn default() -> Self {
        Self(Semaphore::new(0))
    }
}

impl Credit {
    pub fn grant(&self, n: u32) {
        // the semaphore panics above its maximum, a peer should never get there
        let room = Semaphore::MAX_PERMITS - self.0.available_permits();
        self.0.add_permits((n as usize).min(room));
    }

    /// Waits for one element worth of credit and consumes it.
    pub async fn acquire(&self) {
        // the semaphore is never closed
        if let Ok(permit) = self.0.acquire().await {
            permit.forget();
        }
    }

    pub fn available(&self) -> usize {
        self.0.available_permits()
    }
}

#[cfg(test)]
mod test {
    use futures::FutureExt as _;

    use super::*;

    #[test]
    fn credit_is_consumed() {
        let credit = Credit::default();
        assert!(credit.acquire().now_or_never().is_none());

        credit.grant(2);
        assert!(credit.acquire().now_or_never().is_some());
        assert!(credit.acquire().now_or_never().is_some());
        assert!(credit.acquire().now_or_never().is_none());
    }

    #[test]
    fn huge_grants_saturate() {
        let credit = Credit::default();
        for _ in 0..4 {
            credit.grant(u32::MAX);
        }
        assert_eq!(credit.available(), 4 * u32::MAX as usize);
    }
}
