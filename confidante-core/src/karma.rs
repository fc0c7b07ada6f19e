//! Token-bucket read-rate shaping for a single connection.
//!
//! Grounded on `struct karma` / `karma_increment` / `karma_decrement` in
//! `examples/original_source/jabberd14/jadc2s/mio/limits.c`: the tokio
//! rewrite keeps the same four knobs and the same heartbeat-driven
//! recovery, but drives it from a `tokio::time::interval` tick instead of
//! a hand-rolled `time(NULL)` comparison.

use std::time::Duration;

pub const DEFAULT_INIT: i64 = 5;
pub const DEFAULT_MAX: i64 = 10;
pub const DEFAULT_INC: i64 = 1;
pub const DEFAULT_DEC: i64 = 1;
pub const DEFAULT_PENALTY: i64 = -5;
pub const DEFAULT_RESTORE: i64 = 5;
pub const HEARTBEAT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct KarmaConfig {
    pub init: i64,
    pub max: i64,
    pub inc: i64,
    pub dec: i64,
    pub penalty: i64,
    pub restore: i64,
    pub reset_meter: bool,
}

impl Default for KarmaConfig {
    fn default() -> Self {
        Self {
            init: DEFAULT_INIT,
            max: DEFAULT_MAX,
            inc: DEFAULT_INC,
            dec: DEFAULT_DEC,
            penalty: DEFAULT_PENALTY,
            restore: DEFAULT_RESTORE,
            reset_meter: true,
        }
    }
}

/// Per-connection karma counter. Invariant: `value <= max` always.
#[derive(Debug, Clone)]
pub struct Karma {
    config: KarmaConfig,
    value: i64,
    bytes_read_this_window: i64,
}

impl Karma {
    pub fn new(config: KarmaConfig) -> Self {
        Self {
            value: config.init,
            bytes_read_this_window: 0,
            config,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    /// A connection with non-positive karma is excluded from the
    /// readable set until the heartbeat restores it.
    pub fn is_readable(&self) -> bool {
        self.value > 0
    }

    /// `read_max(v) = v * 100` bytes.
    pub fn read_max(&self) -> i64 {
        self.value.max(0) * 100
    }

    /// Heartbeat tick: `value = min(value + inc, max)`; restores to
    /// `restore` on the negative→non-negative transition and optionally
    /// resets the byte meter.
    pub fn tick(&mut self) {
        let was_negative = self.value < 0;
        self.value = (self.value + self.config.inc).min(self.config.max);
        if was_negative && self.value >= 0 {
            self.value = self.config.restore;
            if self.config.reset_meter {
                self.bytes_read_this_window = 0;
            }
        }
    }

    /// Applies a read of `n` bytes: accumulates the byte meter and
    /// applies the penalty once it exceeds `read_max`.
    pub fn record_read(&mut self, n: usize) {
        self.bytes_read_this_window += n as i64;
        if self.bytes_read_this_window > self.read_max() {
            self.value -= self.config.dec;
            if self.value <= 0 {
                self.value = self.config.penalty;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_config() -> KarmaConfig {
        KarmaConfig {
            init: 5,
            max: 10,
            inc: 1,
            dec: 1,
            penalty: -5,
            restore: 5,
            reset_meter: true,
        }
    }

    /// Repeated 600-byte reads exceed `read_max(value)` every time,
    /// decrementing karma down to the penalty value; five heartbeat
    /// ticks then restore it.
    #[test]
    fn repeated_overreads_drive_karma_to_penalty_then_recover() {
        let mut karma = Karma::new(scenario_config());
        assert_eq!(karma.value(), 5);

        karma.record_read(600); // bytes=600 > read_max(5)=500
        assert_eq!(karma.value(), 4);

        karma.record_read(600); // bytes=1200 > read_max(4)=400
        assert_eq!(karma.value(), 3);

        karma.record_read(600); // bytes=1800 > read_max(3)=300
        assert_eq!(karma.value(), 2);

        karma.record_read(600); // bytes=2400 > read_max(2)=200
        assert_eq!(karma.value(), 1);

        karma.record_read(600); // bytes=3000 > read_max(1)=100, value<=0 -> penalty
        assert_eq!(karma.value(), -5);
        assert!(!karma.is_readable());

        for _ in 0..5 {
            karma.tick();
        }
        assert_eq!(karma.value(), 5);
        assert!(karma.is_readable());
    }

    #[test]
    fn value_never_exceeds_max() {
        let mut karma = Karma::new(scenario_config());
        for _ in 0..100 {
            karma.tick();
        }
        assert_eq!(karma.value(), 10);
    }

    #[test]
    fn read_max_scales_with_value() {
        let karma = Karma::new(scenario_config());
        assert_eq!(karma.read_max(), 500);
    }

    #[test]
    fn non_positive_karma_excluded_from_readable_set() {
        let mut karma = Karma::new(scenario_config());
        karma.record_read(10_000);
        assert!(!karma.is_readable());
    }
}
