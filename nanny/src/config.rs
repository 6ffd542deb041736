//! Supervisor configuration.
//!
//! All tunables live here with defaults matching the classic deployment:
//! 60 s health cadence, 5-minute probations, 64 KiB ring logs, rotation at
//! the top of the hour or 1 MB, multicast announcements on 226.1.1.1:8889.

// Layer 1: Standard library imports
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Configuration for a [`Supervisor`](crate::supervisor::Supervisor).
#[derive(Debug, Clone)]
pub struct NannyConfig {
    /// Seconds between health probes of each supervised child.
    pub health_period: i64,

    /// Seconds a health probe may run before it is killed and counted failed.
    pub health_timeout: i64,

    /// Seconds granted to a custom stop command (and to the first SIGTERM
    /// when there is no custom stop) before escalating.
    pub stop_probation: i64,

    /// Seconds granted after each escalation signal.
    pub signal_patience: i64,

    /// Capacity in bytes of each in-memory ring log.
    pub ring_capacity: usize,

    /// Bytes written to one on-disk log file before it is rotated.
    pub rotate_bytes: u64,

    /// Multicast group joined for announcements and queries.
    pub multicast_addr: Ipv4Addr,

    /// Multicast port.
    pub multicast_port: u16,

    /// Directory receiving the children's rotating log files.
    pub log_dir: PathBuf,

    /// Path for the FIFO counter socket; `None` picks a random
    /// `/tmp/nanny_socket_*` name.
    pub counter_path: Option<PathBuf>,
}

impl Default for NannyConfig {
    fn default() -> Self {
        Self {
            health_period: 60,
            health_timeout: 60,
            stop_probation: 300,
            signal_patience: 15,
            ring_capacity: 64 * 1024,
            rotate_bytes: 1_000_000,
            multicast_addr: Ipv4Addr::new(226, 1, 1, 1),
            multicast_port: 8889,
            log_dir: PathBuf::from("/tmp"),
            counter_path: None,
        }
    }
}

impl NannyConfig {
    /// Probation window after a spawn: five health periods.
    pub fn start_probation(&self) -> i64 {
        self.health_period * 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NannyConfig::default();
        assert_eq!(config.health_period, 60);
        assert_eq!(config.health_timeout, 60);
        assert_eq!(config.stop_probation, 300);
        assert_eq!(config.start_probation(), 300);
        assert_eq!(config.ring_capacity, 65536);
        assert_eq!(config.multicast_port, 8889);
    }
}
