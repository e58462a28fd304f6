//! Attempt pacing.
//!
//! The controller schedules attempt *starts*: the time spent inside an
//! attempt is subtracted from the next delay, so per-call latency is
//! absorbed instead of stacked on top of the target period.

use std::time::Duration;

use rand::{RngExt as _, SeedableRng as _, rngs::StdRng};
use tokio::time::Instant;

use crate::workload::{BurstBand, TransactionMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pacing {
    /// Fixed target period with uniform jitter in `[period - jitter, period + jitter]`.
    Fixed { period: Duration, jitter: Duration },
    /// Two alternating bands, selected by time elapsed since the baseline.
    Burst { bands: [BurstBand; 2] },
}

impl Pacing {
    pub fn from_mode(mode: &TransactionMode) -> Self {
        match mode {
            TransactionMode::Constant { freq_ms, jitter_ms } => Pacing::Fixed {
                period: Duration::from_millis(*freq_ms),
                jitter: Duration::from_millis(*jitter_ms),
            },
            TransactionMode::Mix { freq_ms } | TransactionMode::Proposal { freq_ms } => {
                Pacing::Fixed {
                    period: Duration::from_millis(*freq_ms),
                    jitter: Duration::ZERO,
                }
            }
            TransactionMode::Latency => Pacing::Fixed {
                period: Duration::ZERO,
                jitter: Duration::ZERO,
            },
            TransactionMode::Burst { bands } => Pacing::Burst { bands: *bands },
        }
    }
}

/// Computes the delay before the next attempt.
#[derive(Debug)]
pub struct FrequencyController {
    pacing: Pacing,
    baseline: Instant,
    rng: StdRng,
}

impl FrequencyController {
    /// Create a controller whose burst bands are aligned on `baseline`.
    pub fn new(pacing: Pacing, baseline: Instant) -> Self {
        Self::new_with_rng(pacing, baseline, StdRng::seed_from_u64(rand::random()))
    }

    pub fn new_with_rng(pacing: Pacing, baseline: Instant, rng: StdRng) -> Self {
        Self {
            pacing,
            baseline,
            rng,
        }
    }

    pub fn pacing(&self) -> &Pacing {
        &self.pacing
    }

    /// Target period for an attempt taking place at `now`.
    pub fn target_period(&mut self, now: Instant) -> Duration {
        match &self.pacing {
            Pacing::Fixed { period, jitter } => {
                if jitter.is_zero() {
                    return *period;
                }
                let period = duration_ms(*period);
                let jitter = duration_ms(*jitter);
                let draw = self
                    .rng
                    .random_range(period.saturating_sub(jitter)..=period.saturating_add(jitter));
                Duration::from_millis(u64::try_from(draw.max(0)).unwrap_or_default())
            }
            Pacing::Burst { bands } => {
                let cycle = bands[0].duration_ms.saturating_add(bands[1].duration_ms);
                if cycle == 0 {
                    return Duration::ZERO;
                }
                let elapsed = u64::try_from(now.duration_since(self.baseline).as_millis())
                    .unwrap_or(u64::MAX);
                let band = if elapsed % cycle < bands[0].duration_ms {
                    &bands[0]
                } else {
                    &bands[1]
                };
                Duration::from_millis(band.freq_ms)
            }
        }
    }

    /// Delay before the next attempt, given when the previous one started.
    pub fn next_delay(&mut self, last_attempt_start: Instant, now: Instant) -> Duration {
        let target = self.target_period(now);
        compute_delay(target, now.duration_since(last_attempt_start))
    }
}

/// `max(0, target - elapsed)`.
pub fn compute_delay(target: Duration, elapsed: Duration) -> Duration {
    target.saturating_sub(elapsed)
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    fn fixed(period_ms: u64, jitter_ms: u64) -> Pacing {
        Pacing::Fixed {
            period: Duration::from_millis(period_ms),
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    #[test]
    fn test_compute_delay() {
        let ms = Duration::from_millis;
        assert_eq!(compute_delay(ms(100), ms(30)), ms(70));
        assert_eq!(compute_delay(ms(100), ms(100)), ms(0));
        assert_eq!(compute_delay(ms(100), ms(250)), ms(0));
        assert_eq!(compute_delay(ms(0), ms(5)), ms(0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_converges_on_target_period_despite_latency() {
        time::pause();

        let start = Instant::now();
        let mut controller = FrequencyController::new(fixed(100, 0), start);
        let mut attempt_starts = Vec::with_capacity(100);

        for _ in 0..100 {
            let attempt_start = Instant::now();
            attempt_starts.push(attempt_start);
            // simulated per-call latency
            time::advance(Duration::from_millis(30)).await;
            let delay = controller.next_delay(attempt_start, Instant::now());
            assert_eq!(delay, Duration::from_millis(70));
            time::advance(delay).await;
        }

        let total = attempt_starts[99].duration_since(attempt_starts[0]);
        let avg_ms = total.as_millis() as f64 / 99.0;
        assert!((avg_ms - 100.0).abs() < 1.0, "avg interval: {avg_ms}ms");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_jitter_stays_in_bounds() {
        time::pause();

        let now = Instant::now();
        let mut controller =
            FrequencyController::new_with_rng(fixed(100, 20), now, StdRng::seed_from_u64(42));

        let mut seen_min = u128::MAX;
        let mut seen_max = 0;
        for _ in 0..1000 {
            let ms = controller.target_period(now).as_millis();
            assert!((80..=120).contains(&ms), "period: {ms}ms");
            seen_min = seen_min.min(ms);
            seen_max = seen_max.max(ms);
        }
        assert!(seen_min < 90);
        assert!(seen_max > 110);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_jitter_larger_than_period_clamps_to_zero() {
        time::pause();

        let now = Instant::now();
        let mut controller =
            FrequencyController::new_with_rng(fixed(10, 50), now, StdRng::seed_from_u64(7));

        let mut zeros = 0;
        for _ in 0..1000 {
            let period = controller.target_period(now);
            assert!(period <= Duration::from_millis(60));
            if period.is_zero() {
                zeros += 1;
            }
        }
        assert!(zeros > 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_burst_bands_follow_elapsed_time() {
        time::pause();

        let baseline = Instant::now();
        let mut controller = FrequencyController::new(
            Pacing::Burst {
                bands: [
                    BurstBand {
                        freq_ms: 10,
                        duration_ms: 1000,
                    },
                    BurstBand {
                        freq_ms: 500,
                        duration_ms: 3000,
                    },
                ],
            },
            baseline,
        );

        for (at_ms, expected_ms) in [(0, 10), (999, 10), (1000, 500), (3999, 500), (4000, 10), (5500, 500)] {
            let now = baseline + Duration::from_millis(at_ms);
            assert_eq!(
                controller.target_period(now),
                Duration::from_millis(expected_ms),
                "at {at_ms}ms"
            );
        }

        // elapsed correction also applies in burst mode
        let now = baseline + Duration::from_millis(1200);
        let last = baseline + Duration::from_millis(1100);
        assert_eq!(controller.next_delay(last, now), Duration::from_millis(400));
    }

    #[test]
    fn test_pacing_from_mode() {
        assert_eq!(Pacing::from_mode(&TransactionMode::Latency), fixed(0, 0));
        assert_eq!(
            Pacing::from_mode(&TransactionMode::Constant {
                freq_ms: 50,
                jitter_ms: 5
            }),
            fixed(50, 5)
        );
        assert_eq!(
            Pacing::from_mode(&TransactionMode::Mix { freq_ms: 20 }),
            fixed(20, 0)
        );
    }
}
