use std::time::Duration;
use strum_macros::{AsRefStr, Display, EnumString};

/// What the controller does with a claim whose expansion failed terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TerminalFailurePolicy {
    /// Keep the larger request, record the failure on the `Resizing` condition and
    /// retry at the slow terminal interval.
    #[default]
    LeavePending,
    /// Reset the request back to the achieved capacity.
    Revert,
}

/// Tunables shared by the controller and the node agent.
#[derive(Debug, Clone)]
pub struct ResizeConfig {
    /// Allow expansion of volumes attached to a node.
    online_expansion: bool,
    /// Requeue delay after a transient expansion failure.
    retry_interval: Duration,
    /// Requeue delay after a terminal expansion failure left pending.
    terminal_retry_interval: Duration,
    /// Interval between polls of a bounded wait.
    poll_interval: Duration,
    /// Budget for a capacity update to be accepted.
    update_timeout: Duration,
    /// Budget for a single resize step to complete.
    resize_timeout: Duration,
    failure_policy: TerminalFailurePolicy,
}

fn default_duration(value: &str) -> Duration {
    humantime::parse_duration(value).unwrap_or_default()
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            online_expansion: true,
            retry_interval: default_duration(utils::RESIZE_RETRY_INTERVAL),
            terminal_retry_interval: default_duration(utils::TERMINAL_RESIZE_RETRY_INTERVAL),
            poll_interval: default_duration(utils::RESIZE_POLL_INTERVAL),
            update_timeout: default_duration(utils::CAPACITY_UPDATE_TIMEOUT),
            resize_timeout: default_duration(utils::TOTAL_RESIZE_WAIT_PERIOD),
            failure_policy: TerminalFailurePolicy::default(),
        }
    }
}

impl ResizeConfig {
    /// Return a new `Self` with the default tunables.
    pub fn new() -> Self {
        Self::default()
    }
    /// Enable or disable expansion of attached volumes.
    pub fn with_online_expansion(mut self, enabled: bool) -> Self {
        self.online_expansion = enabled;
        self
    }
    /// Set the transient failure requeue delay.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
    /// Set the terminal failure requeue delay.
    pub fn with_terminal_retry_interval(mut self, interval: Duration) -> Self {
        self.terminal_retry_interval = interval;
        self
    }
    /// Set the poll interval of the bounded waits.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
    /// Set the capacity update budget.
    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }
    /// Set the per step resize budget.
    pub fn with_resize_timeout(mut self, timeout: Duration) -> Self {
        self.resize_timeout = timeout;
        self
    }
    /// Set the terminal failure policy.
    pub fn with_failure_policy(mut self, policy: TerminalFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Get the online expansion flag.
    pub fn online_expansion(&self) -> bool {
        self.online_expansion
    }
    /// Get the transient failure requeue delay.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
    /// Get the terminal failure requeue delay.
    pub fn terminal_retry_interval(&self) -> Duration {
        self.terminal_retry_interval
    }
    /// Get the poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
    /// Get the capacity update budget.
    pub fn update_timeout(&self) -> Duration {
        self.update_timeout
    }
    /// Get the per step resize budget.
    pub fn resize_timeout(&self) -> Duration {
        self.resize_timeout
    }
    /// Get the terminal failure policy.
    pub fn failure_policy(&self) -> TerminalFailurePolicy {
        self.failure_policy
    }
}
