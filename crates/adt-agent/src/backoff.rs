use rand::Rng;
use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Fraction of each delay applied as random spread in both directions.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1.0,
            max: delay,
            jitter: 0.0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: self.initial.min(self.max),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let multiplier = if self.policy.multiplier.is_finite() {
            self.policy.multiplier.max(1.0)
        } else {
            1.0
        };
        self.current = Duration::try_from_secs_f64(base.as_secs_f64() * multiplier)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        apply_jitter(base, self.policy.jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.max);
    }
}

fn apply_jitter(base: Duration, jitter: f64) -> Duration {
    if jitter.is_nan() || jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let spread = base.as_secs_f64() * jitter.min(1.0);
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}
