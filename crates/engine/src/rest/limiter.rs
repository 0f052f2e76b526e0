use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use super::{RestError, RestErrorKind};

/// Client-side request spacing plus a cooldown window after the exchange
/// signals a rate limit.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    next_slot: Instant,
    cooldown_until: Option<Instant>,
}

impl RateLimiter {
    /// `0` disables spacing.
    pub fn per_second(max_requests: u32) -> Self {
        let spacing = if max_requests == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / max_requests
        };
        Self {
            spacing,
            state: Mutex::new(LimiterState {
                next_slot: Instant::now(),
                cooldown_until: None,
            }),
        }
    }

    /// Wait for the next request slot. Fails immediately while cooling down.
    pub async fn acquire(&self) -> Result<(), RestError> {
        let slot = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if let Some(until) = state.cooldown_until {
                if until > now {
                    return Err(RestError::new(
                        RestErrorKind::RateLimited,
                        format!("cooling down for {:?}", until - now),
                    ));
                }
                state.cooldown_until = None;
            }
            let slot = state.next_slot.max(now);
            state.next_slot = slot + self.spacing;
            slot
        };
        sleep_until(slot).await;
        Ok(())
    }

    /// Refuse requests for `period`.
    pub async fn cool_down(&self, period: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + period;
        state.cooldown_until = Some(state.cooldown_until.map_or(until, |u| u.max(until)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_requests() {
        let limiter = RateLimiter::per_second(10);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_while_cooling_down() {
        let limiter = RateLimiter::per_second(0);
        limiter.cool_down(Duration::from_secs(2)).await;
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.kind, RestErrorKind::RateLimited);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(limiter.acquire().await.is_ok());
    }
}
