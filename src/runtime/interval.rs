use std::time::Duration;

/// A thin wrapper around `tokio::time::Interval`.
///
/// Exists so the rest of the crate depends on `crate::runtime::Interval` rather than reaching
/// into `tokio::time` directly, matching the narrow-surface goal of this module.
pub(crate) struct Interval {
    inner: tokio::time::Interval,
}

impl Interval {
    pub(crate) fn new(period: Duration) -> Self {
        let mut inner = tokio::time::interval(period);
        // Ticks that fall behind (e.g. because the loop was busy) are coalesced rather than
        // fired back-to-back; the maintenance work this drives is amortized and idempotent.
        inner.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { inner }
    }

    pub(crate) async fn tick(&mut self) {
        self.inner.tick().await;
    }
}
