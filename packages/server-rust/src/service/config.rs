use std::time::Duration;

use uuid::Uuid;

use super::settings::SettingsProvider;

/// Prefix of generated instance identifiers.
pub const INSTANCE_ID_PREFIX: &str = "INST-";

/// Instance-level configuration of the bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Domain this instance belongs to; names its requests-in queue.
    pub service_domain_name: String,
    /// Unique identifier of this instance within its domain.
    pub instance_id: String,
    /// Name of the microservice the bootstrap loader starts.
    pub service_class: String,
    /// Maximum requests executed concurrently before rejecting; `0` = unlimited.
    pub service_call_capacity: u64,
    /// Deadline for a pending call in milliseconds; `0` disables timeouts.
    pub call_timeout_ms: u64,
    /// Interval between sweeps for overdue pending calls.
    pub reaper_interval_ms: u64,
    /// Size of the worker pool the node runtime is built with.
    pub worker_threads: usize,
    /// How long shutdown waits for in-flight requests.
    pub shutdown_grace_ms: u64,
}

impl BusConfig {
    /// Config for `service_domain_name` with a freshly generated instance id.
    #[must_use]
    pub fn for_domain(service_domain_name: impl Into<String>) -> Self {
        Self {
            service_domain_name: service_domain_name.into(),
            ..Self::default()
        }
    }

    /// Overlays tunables found in `settings` on top of `self`.
    #[must_use]
    pub fn from_settings(mut self, settings: &dyn SettingsProvider) -> Self {
        self.service_call_capacity =
            settings.get_u64("serviceCallCapacity", self.service_call_capacity);
        self.call_timeout_ms = settings.get_u64("callTimeoutMs", self.call_timeout_ms);
        self.reaper_interval_ms = settings.get_u64("reaperIntervalMs", self.reaper_interval_ms);
        self.worker_threads = settings.get_usize("workerThreads", self.worker_threads);
        self
    }

    /// `None` when timeouts are disabled.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_domain_name: String::new(),
            instance_id: generate_instance_id(),
            service_class: String::new(),
            service_call_capacity: 0,
            call_timeout_ms: 30_000,
            reaper_interval_ms: 1_000,
            worker_threads: 3,
            shutdown_grace_ms: 60_000,
        }
    }
}

/// `"INST-" + uuid v4`.
#[must_use]
pub fn generate_instance_id() -> String {
    format!("{INSTANCE_ID_PREFIX}{}", Uuid::new_v4())
}
