use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Milliseconds since the unix epoch, 0 if the system clock is before it.
pub fn unix_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// About thirty years, the furthest a start time is ever scheduled.
pub const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Anchors the monotonic (tokio) clock to unix wall-clock milliseconds.
///
/// All timing decisions are made on [`Instant`]s so they follow
/// `tokio::time::pause` in tests; the anchor is only used to render
/// the start/end timestamps that are reported across workers.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    base_instant: Instant,
    base_epoch_ms: u64,
}

impl WallClock {
    pub fn now() -> Self {
        Self::new(Instant::now(), unix_epoch_ms())
    }

    pub fn new(base_instant: Instant, base_epoch_ms: u64) -> Self {
        Self {
            base_instant,
            base_epoch_ms,
        }
    }

    pub fn epoch_ms(&self, at: Instant) -> u64 {
        if at >= self.base_instant {
            self.base_epoch_ms + (at - self.base_instant).as_millis() as u64
        } else {
            self.base_epoch_ms
                .saturating_sub((self.base_instant - at).as_millis() as u64)
        }
    }

    /// Monotonic instant matching the given wall-clock time.
    ///
    /// Times too far ahead to be represented are clamped to [`FAR_FUTURE`]
    /// after the anchor.
    pub fn instant_at(&self, epoch_ms: u64) -> Instant {
        if epoch_ms >= self.base_epoch_ms {
            let ahead = Duration::from_millis(epoch_ms - self.base_epoch_ms).min(FAR_FUTURE);
            self.base_instant
                .checked_add(ahead)
                .unwrap_or(self.base_instant + FAR_FUTURE)
        } else {
            self.base_instant
                .checked_sub(Duration::from_millis(self.base_epoch_ms - epoch_ms))
                .unwrap_or(self.base_instant)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn wall_clock_follows_paused_time() {
        tokio::time::pause();

        let clock = WallClock::new(Instant::now(), 1_000_000);
        tokio::time::advance(Duration::from_millis(250)).await;

        assert_eq!(clock.epoch_ms(Instant::now()), 1_000_250);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn instant_at_round_trips_future_timestamps() {
        tokio::time::pause();

        let base = Instant::now();
        let clock = WallClock::new(base, 5_000);

        assert_eq!(clock.instant_at(7_500), base + Duration::from_millis(2_500));
        assert_eq!(clock.epoch_ms(clock.instant_at(7_500)), 7_500);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn instant_at_clamps_unrepresentable_timestamps() {
        tokio::time::pause();

        let base = Instant::now();
        let clock = WallClock::new(base, 5_000);

        assert_eq!(clock.instant_at(u64::MAX), base + FAR_FUTURE);
        assert!(clock.instant_at(u64::MAX) > clock.instant_at(7_500));
    }
}
