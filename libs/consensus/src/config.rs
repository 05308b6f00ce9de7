//! Engine configuration

use std::time::Duration;

/// Tunable knobs for a consensus engine
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// The actual per-replica timeout is randomized between min and max to
    /// reduce split-vote collisions.
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    pub election_timeout_max: Duration,

    /// Period of the leader replication loop (heartbeat interval)
    ///
    /// Must be well below the election timeout so followers do not time out
    /// under a healthy leader.
    pub replication_interval: Duration,

    /// Delay between polls while a membership change waits for commit
    pub membership_poll_interval: Duration,

    /// Number of polls before a membership change wait reports a timeout
    pub membership_poll_budget: u32,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            // The observed system shipped multi-second timeouts for log
            // readability; these are production-leaning values, still
            // overridable per deployment.
            election_timeout_min: Duration::from_millis(600),
            election_timeout_max: Duration::from_millis(1200),

            replication_interval: Duration::from_millis(50),

            membership_poll_interval: Duration::from_millis(100),
            membership_poll_budget: 100,
        }
    }
}

/// Builder for [`RaftConfig`]
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn replication_interval(mut self, interval: Duration) -> Self {
        self.config.replication_interval = interval;
        self
    }

    pub fn membership_poll(mut self, interval: Duration, budget: u32) -> Self {
        self.config.membership_poll_interval = interval;
        self.config.membership_poll_budget = budget;
        self
    }

    pub fn build(self) -> RaftConfig {
        assert!(
            self.config.election_timeout_min < self.config.election_timeout_max,
            "election_timeout_min must be less than election_timeout_max"
        );
        assert!(
            self.config.replication_interval < self.config.election_timeout_min,
            "replication_interval must be less than election_timeout_min"
        );
        assert!(
            self.config.membership_poll_budget > 0,
            "membership_poll_budget must be greater than 0"
        );
        self.config
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
