//! Request pacing for the two upstream providers.
//!
//! Both limiters share one contract: call [`RateLimit::enforce`] *before*
//! issuing a request. The window limiter smooths OHLCV requests to an even
//! spacing; the burst limiter implements the empirically derived
//! delay+cooldown discipline of the posttrade drop.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[async_trait]
pub trait RateLimit: Send + Sync {
    async fn enforce(&self);
}

/// Bound on consecutive deficit sleeps so a misbehaving clock cannot spin
/// the enforcement loop forever.
const MAX_DEFICIT_SLEEPS: u32 = 16;

/// Smoothed pacing: no more than `max_requests` issued in any trailing
/// `window`. Keeps a ring of the last `max_requests` issue times and sleeps
/// whatever deficit remains against the even spacing `window / max_requests`.
pub struct WindowLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<Vec<Instant>>,
}

impl WindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            issued: Mutex::new(Vec::new()),
        }
    }

    fn spacing(&self) -> Duration {
        self.window / self.max_requests as u32
    }
}

#[async_trait]
impl RateLimit for WindowLimiter {
    async fn enforce(&self) {
        let mut issued = self.issued.lock().await;
        if issued.is_empty() {
            issued.push(Instant::now());
            return;
        }
        let spacing = self.spacing();
        for _ in 0..MAX_DEFICIT_SLEEPS {
            let newest = *issued.last().unwrap_or(&Instant::now());
            let elapsed = newest.elapsed();
            if elapsed < spacing {
                let deficit = spacing - elapsed;
                tracing::debug!(?deficit, "window limiter sleeping");
                sleep(deficit).await;
            } else {
                break;
            }
        }
        issued.push(Instant::now());
        if issued.len() > self.max_requests {
            issued.remove(0);
        }
    }
}

struct BurstState {
    request_count: u64,
    last_request: Option<Instant>,
}

/// Burst+cooldown pacing for the posttrade drop.
///
/// Between any two requests at least `inter_request_delay` elapses, and
/// after every `burst_size` requests a full `burst_cooldown` is inserted
/// before the next one. The defaults (0.6 s, 30, 35 s) produced zero HTTP
/// 429s across 810 consecutive downloads; an approximate linear relation
/// `cooldown ≈ -23.08 * delay + 49.34` guides retuning but is not enforced.
pub struct BurstLimiter {
    inter_request_delay: Duration,
    burst_size: u64,
    burst_cooldown: Duration,
    state: Mutex<BurstState>,
}

impl BurstLimiter {
    pub fn new(inter_request_delay: Duration, burst_size: u64, burst_cooldown: Duration) -> Self {
        Self {
            inter_request_delay,
            burst_size: burst_size.max(1),
            burst_cooldown,
            state: Mutex::new(BurstState {
                request_count: 0,
                last_request: None,
            }),
        }
    }
}

#[async_trait]
impl RateLimit for BurstLimiter {
    async fn enforce(&self) {
        let mut state = self.state.lock().await;
        // The reference point is taken on entry: a cooldown does not count
        // toward the inter-request delay.
        let entered = Instant::now();

        if state.request_count > 0 && state.request_count % self.burst_size == 0 {
            tracing::info!(
                requests = state.request_count,
                cooldown_secs = self.burst_cooldown.as_secs_f64(),
                "burst cooldown before next request"
            );
            sleep(self.burst_cooldown).await;
            tracing::info!("burst cooldown complete");
        }

        if let Some(last) = state.last_request {
            let elapsed = entered.saturating_duration_since(last);
            if elapsed < self.inter_request_delay {
                let deficit = self.inter_request_delay - elapsed;
                tracing::debug!(?deficit, "inter-request delay");
                sleep(deficit).await;
            }
        }

        state.last_request = Some(Instant::now());
        state.request_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_limiter_paces_ninety_requests() {
        // (0.6s, 30, 35s): 89 inter-request delays plus cooldowns after the
        // 30th and 60th request.
        let limiter = BurstLimiter::new(Duration::from_millis(600), 30, Duration::from_secs(35));
        let start = Instant::now();
        for _ in 0..90 {
            limiter.enforce().await;
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(123_400),
            "expected >= 123.4s, got {elapsed:?}"
        );
        // No pathological over-sleeping either.
        assert!(elapsed < Duration::from_millis(130_000));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_limiter_first_request_is_free() {
        let limiter = BurstLimiter::new(Duration::from_millis(600), 30, Duration::from_secs(35));
        let start = Instant::now();
        limiter.enforce().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn window_limiter_spreads_requests_evenly() {
        // 3 requests per 2 seconds -> one request every ~666ms.
        let limiter = WindowLimiter::new(3, Duration::from_secs(2));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.enforce().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1990), "got {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn window_limiter_no_sleep_when_idle() {
        let limiter = WindowLimiter::new(3, Duration::from_secs(2));
        limiter.enforce().await;
        sleep(Duration::from_secs(5)).await;
        let start = Instant::now();
        limiter.enforce().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }
}
