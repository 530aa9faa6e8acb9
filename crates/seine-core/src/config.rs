//! Engine and pool configuration.

use std::time::Duration;

/// Default capacity of the per-session send and receive queues.
pub const DEFAULT_QUEUE_SIZE: usize = 16;

/// Per-session I/O tuning shared by clients and servers.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Capacity of the outbound message queue.
    pub send_queue_size: usize,
    /// Capacity of the inbound message queue.
    pub recv_queue_size: usize,
    /// Deadline applied before each read; zero disables it. A session with a
    /// read timeout observes idle periods through [`Handler::on_idle`].
    ///
    /// [`Handler::on_idle`]: crate::Handler::on_idle
    pub read_timeout: Duration,
    /// Deadline applied before each write; zero disables it.
    pub write_timeout: Duration,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            send_queue_size: DEFAULT_QUEUE_SIZE,
            recv_queue_size: DEFAULT_QUEUE_SIZE,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
        }
    }
}

/// Client engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub io: IoConfig,
    /// When true, `send`/`call` on a disconnected engine dial again lazily.
    pub auto_reconnect: bool,
}

/// Server engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub io: IoConfig,
    /// Upper bound on concurrently accepted connections; zero means no cap.
    pub max_connections: usize,
}

/// Client pool sizing.
///
/// `normalized` enforces `idle_min <= idle_max <= max`, raising the upper
/// value of any violated pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolConfig {
    /// Clients constructed up front by [`Pool::open`].
    ///
    /// [`Pool::open`]: crate::Pool::open
    pub idle_min: usize,
    /// Capacity of the idle free-list; returns beyond it close the client.
    pub idle_max: usize,
    /// Ceiling on live clients (idle plus checked out).
    pub max: usize,
}

impl PoolConfig {
    pub(crate) fn normalized(mut self) -> Self {
        if self.idle_max < self.idle_min {
            self.idle_max = self.idle_min;
        }
        if self.max < self.idle_max {
            self.max = self.idle_max;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_defaults() {
        let io = IoConfig::default();
        assert_eq!(io.send_queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(io.recv_queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(io.read_timeout, Duration::ZERO);
        assert_eq!(io.write_timeout, Duration::ZERO);
    }

    #[test]
    fn pool_config_normalizes_upward() {
        let c = PoolConfig { idle_min: 5, idle_max: 2, max: 1 }.normalized();
        assert_eq!((c.idle_min, c.idle_max, c.max), (5, 5, 5));

        let c = PoolConfig { idle_min: 0, idle_max: 1, max: 2 }.normalized();
        assert_eq!((c.idle_min, c.idle_max, c.max), (0, 1, 2));

        let c = PoolConfig { idle_min: 2, idle_max: 4, max: 4 }.normalized();
        assert_eq!((c.idle_min, c.idle_max, c.max), (2, 4, 4));
    }
}
