//! Per-IP connection-rate admission control. Grounded on
//! `connection_rate_check`/
//! `connection_rate_cleanup` in
//! `examples/original_source/jadc2s/rate.cc`: a single-window
//! `(first_time, count)` entry per remote address, reset once its window
//! has expired, incremented otherwise and rejected past the configured
//! limit.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub limit: u32,
}

struct Entry {
    first_seen: Instant,
    count: u32,
}

/// Maps remote IP to `(first-seen, count-since-first-seen)`.
pub struct ConnectionRateTable {
    config: RateLimitConfig,
    entries: HashMap<IpAddr, Entry>,
}

impl ConnectionRateTable {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Registers a new connection attempt from `ip`. Returns `true` if
    /// admitted, `false` if the IP has exceeded its rate limit.
    pub fn admit(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.config.limit == 0 || self.config.window.is_zero() {
            return true;
        }

        match self.entries.get_mut(&ip) {
            None => {
                self.entries.insert(
                    ip,
                    Entry {
                        first_seen: now,
                        count: 1,
                    },
                );
                true
            }
            Some(entry) => {
                if now.duration_since(entry.first_seen) > self.config.window {
                    entry.first_seen = now;
                    entry.count = 1;
                    true
                } else {
                    entry.count += 1;
                    entry.count <= self.config.limit
                }
            }
        }
    }

    /// Periodic sweep reaping expired entries.
    pub fn sweep(&mut self, now: Instant) {
        self.entries
            .retain(|_, entry| now.duration_since(entry.first_seen) <= self.config.window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalizes an IPv4-mapped IPv6 address to plain IPv4.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        ip => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
    }

    #[test]
    fn admits_up_to_limit() {
        let mut table = ConnectionRateTable::new(RateLimitConfig {
            window: Duration::from_secs(60),
            limit: 3,
        });
        let now = Instant::now();
        let addr = ip(1);
        assert!(table.admit(addr, now));
        assert!(table.admit(addr, now));
        assert!(table.admit(addr, now));
        assert!(!table.admit(addr, now));
    }

    #[test]
    fn resets_after_window_expires() {
        let mut table = ConnectionRateTable::new(RateLimitConfig {
            window: Duration::from_secs(60),
            limit: 1,
        });
        let now = Instant::now();
        let addr = ip(2);
        assert!(table.admit(addr, now));
        assert!(!table.admit(addr, now));
        let later = now + Duration::from_secs(61);
        assert!(table.admit(addr, later));
    }

    #[test]
    fn sweep_reaps_expired_entries() {
        let mut table = ConnectionRateTable::new(RateLimitConfig {
            window: Duration::from_secs(60),
            limit: 5,
        });
        let now = Instant::now();
        table.admit(ip(3), now);
        assert_eq!(table.len(), 1);
        table.sweep(now + Duration::from_secs(120));
        assert!(table.is_empty());
    }

    #[test]
    fn zero_limit_disables_rate_limiting() {
        let mut table = ConnectionRateTable::new(RateLimitConfig {
            window: Duration::from_secs(60),
            limit: 0,
        });
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(table.admit(ip(4), now));
        }
    }

    #[test]
    fn ipv4_mapped_ipv6_normalizes_to_ipv4() {
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(normalize_ip(mapped), "192.0.2.1".parse::<IpAddr>().unwrap());
    }
}
