//! Automatic reconnection after an established connection drops.
//!
//! [`ReconnectPolicy`] bounds the retry loop and shapes the delay between
//! attempts; [`ReconnectState`] tracks one run of the loop.

use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tsp_net::Transport;

use crate::client::Inner;
use crate::error::CommandError;
use crate::state::{ConnectionState, Phase};

/// Largest backoff factor accepted from configuration.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Retry limits and pacing for automatic reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts per drop before giving up. `None` retries forever, `Some(0)`
    /// never retries.
    pub max_attempts: Option<u32>,
    /// Wait before the first attempt. Zero retries immediately.
    pub interval: Duration,
    /// Factor applied to the wait after each attempt. `1.0` keeps it fixed.
    pub backoff_multiplier: f64,
    /// Upper bound for the wait.
    pub max_interval: Duration,
    /// Random spread applied as `±jitter` of the wait. Values outside
    /// `0.0..=1.0` are clamped when used.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            interval: Duration::from_millis(500),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed wait between at most `max_attempts` attempts.
    pub fn fixed(max_attempts: Option<u32>, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            ..Self::default()
        }
    }

    /// Never reconnect automatically.
    pub fn disabled() -> Self {
        Self::fixed(Some(0), Duration::ZERO)
    }
}

impl From<&tsp_config::ReconnectConfig> for ReconnectPolicy {
    fn from(config: &tsp_config::ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            interval: Duration::from_millis(config.interval_ms),
            backoff_multiplier: if config.backoff_multiplier.is_nan() {
                1.0
            } else {
                config.backoff_multiplier.clamp(1.0, MAX_BACKOFF_MULTIPLIER)
            },
            max_interval: Duration::from_millis(config.max_interval_ms),
            jitter: if config.jitter.is_nan() {
                0.0
            } else {
                config.jitter.clamp(0.0, 1.0)
            },
        }
    }
}

/// Attempt count and next wait for one run of the retry loop.
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    /// Start a run with no attempts made.
    pub fn new(policy: ReconnectPolicy) -> Self {
        let initial = policy.interval;
        Self {
            policy,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Whether the policy allows another attempt.
    pub fn has_attempts_left(&self) -> bool {
        self.policy.max_attempts.is_none_or(|max| self.attempts < max)
    }

    /// Wait to apply before the next attempt, advancing the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay;
        if base.is_zero() {
            return base;
        }

        let cap = self.policy.max_interval;
        let spread = self.policy.jitter.clamp(0.0, 1.0);
        let delay = if spread > 0.0 {
            let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
            scale(base, factor, cap)
        } else {
            base.min(cap)
        };

        self.current_delay = scale(base, self.policy.backoff_multiplier, cap);
        delay
    }

    /// Count an attempt and return its 1-based number.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// `delay * factor`, capped at `cap`. Overflow and non-finite factors give `cap`.
fn scale(delay: Duration, factor: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).map_or(cap, |d| d.min(cap))
}

impl<T: Transport> Inner<T> {
    /// Handle a dropped link: retry per the stored policy, then either restore
    /// the session or fail everything outstanding.
    ///
    /// A drop of a link other than the newest one, or seen in any state other
    /// than `Connected`, is ignored. At most one retry loop is alive.
    pub(crate) async fn on_drop(&self, link: u64) {
        {
            let _queue = self.dispatcher.lock();
            if link != self.current_link() {
                tracing::debug!(link, "Ignoring drop of a superseded link");
                return;
            }
            match self.state.current() {
                ConnectionState::Connected => self.state.set(ConnectionState::Reconnecting),
                other => {
                    tracing::debug!(state = ?other, "Ignoring link drop");
                    return;
                }
            }
        }
        let Some(target) = self.target() else {
            return;
        };

        self.attempts.store(0, Ordering::SeqCst);
        tracing::warn!(
            "Connection to {}:{} dropped, {} request(s) outstanding",
            target.host,
            target.port,
            self.dispatcher.pending()
        );
        self.notify(Phase::Dropped);

        let mut backoff = ReconnectState::new(target.reconnect.clone());
        while self.should_reconnect(&backoff) {
            let delay = backoff.next_delay();
            if !delay.is_zero() {
                self.notify(Phase::Sleeping);
                tracing::info!("Reconnecting to {}:{} in {delay:?}", target.host, target.port);
                tokio::time::sleep(delay).await;
                if !self.should_reconnect(&backoff) {
                    break;
                }
            }

            let attempt = backoff.record_attempt();
            self.attempts.store(attempt, Ordering::SeqCst);
            match self
                .transport
                .connect(&target.host, target.port, target.timeout, self.open_link())
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        "Reconnected to {}:{} after {attempt} attempt(s)",
                        target.host,
                        target.port
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Reconnect attempt {attempt} to {}:{} failed: {e}",
                        target.host,
                        target.port
                    );
                }
            }
        }

        if self.transport.is_connected() {
            if self.mark_connected(ConnectionState::Reconnecting) {
                self.notify(Phase::Ok);
            } else {
                // disconnect() ran while the last attempt was in progress.
                self.transport.shutdown();
            }
            return;
        }

        let failed = {
            let mut queue = self.dispatcher.lock();
            if self.state.current() != ConnectionState::Reconnecting {
                return;
            }
            self.state.set(ConnectionState::Stopped);
            self.dispatcher
                .drain_with_failure(&mut queue, CommandError::ConnectionLost)
        };
        tracing::warn!(
            "Gave up reconnecting to {}:{} after {} attempt(s), failed {failed} request(s)",
            target.host,
            target.port,
            backoff.attempts()
        );
        self.notify(Phase::Stopped);
    }

    fn should_reconnect(&self, backoff: &ReconnectState) -> bool {
        !self.transport.is_connected()
            && !self.cancelled.load(Ordering::SeqCst)
            && self.state.current() == ConnectionState::Reconnecting
            && backoff.has_attempts_left()
    }
}
