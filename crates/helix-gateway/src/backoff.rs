use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First delay, and the delay restored after a successful handshake
    pub floor_ms: u64,
    /// Multiplier applied after every failed or closed attempt (> 1)
    pub factor: f64,
    /// Upper bound for any single delay
    pub ceiling_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor_ms: 800,
            factor: 1.7,
            ceiling_ms: 15_000,
        }
    }
}

/// Reconnect delay generator.
///
/// `next_delay` returns the current delay and grows it for the following
/// attempt; `reset` goes back to the floor.
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    config: BackoffConfig,
    current_ms: u64,
    attempts: u32,
}

impl ReconnectScheduler {
    pub fn new(config: BackoffConfig) -> Self {
        let config = BackoffConfig {
            factor: if config.factor > 1.0 { config.factor } else { 1.0 },
            ceiling_ms: config.ceiling_ms.max(config.floor_ms),
            ..config
        };
        Self {
            current_ms: config.floor_ms,
            config,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        let grown = (self.current_ms as f64 * self.config.factor).round();
        self.current_ms = if grown >= self.config.ceiling_ms as f64 {
            self.config.ceiling_ms
        } else {
            grown as u64
        };
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.config.floor_ms;
        self.attempts = 0;
    }

    /// Reconnect attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
