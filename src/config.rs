//! Host-side reader settings

use crate::plan::{DEFAULT_MAX_SUBPLANS, MAX_SUBPLANS};
use std::time::Duration;

/// Settings that belong to the host, not the reader.
///
/// Reader-side settings (region, power, plan, ...) go through the parameter
/// store instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Budget for one command/response exchange
    pub command_timeout: Duration,
    /// Line rate used when a serial transport is opened from a URI
    pub baud_rate: u32,
    /// How long `stop_reading` waits for the read loop and dispatcher
    pub stop_grace: Duration,
    /// Bound of the queue between the read loop and listener dispatch
    pub event_capacity: usize,
    /// Largest number of sub-plans accepted in a multi read plan, never
    /// more than [`MAX_SUBPLANS`]
    pub max_subplans: usize,
    /// Largest supported-region list taken into account
    pub max_regions: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(1000),
            baud_rate: 115200,
            stop_grace: Duration::from_secs(5),
            event_capacity: 256,
            max_subplans: DEFAULT_MAX_SUBPLANS,
            max_regions: 32,
        }
    }
}

impl ReaderConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_max_subplans(mut self, limit: usize) -> Self {
        self.max_subplans = limit.min(MAX_SUBPLANS);
        self
    }

    pub fn with_max_regions(mut self, limit: usize) -> Self {
        self.max_regions = limit;
        self
    }

    pub(crate) fn command_timeout_ms(&self) -> u32 {
        self.command_timeout.as_millis().min(u32::MAX as u128) as u32
    }
}
