//! Structured health reporting for daemon lifecycle events.

use std::sync::Arc;

use cmdhub_config::{Config, SocketEndpoint};

use crate::bootstrap::BootstrapError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked once the listening channel accepts petitions.
    fn listening(&self, endpoint: &SocketEndpoint);

    /// Invoked when the dispatch loop begins shutting down.
    fn stopping(&self);

    /// Invoked after shutdown completes.
    fn stopped(&self);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn listening(&self, endpoint: &SocketEndpoint) {
        (**self).listening(endpoint);
    }

    fn stopping(&self) {
        (**self).stopping();
    }

    fn stopped(&self) {
        (**self).stopped();
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting daemon bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            socket = %config.daemon_socket(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            max_parallel_petitions = config.max_parallel_petitions(),
            secondary_handles = config.secondary_handles(),
            "daemon bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "daemon bootstrap failed"
        );
    }

    fn listening(&self, endpoint: &SocketEndpoint) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "listening",
            endpoint = %endpoint,
            "daemon ready for petitions"
        );
    }

    fn stopping(&self) {
        tracing::info!(target: HEALTH_TARGET, event = "stopping", "daemon stopping");
    }

    fn stopped(&self) {
        tracing::info!(target: HEALTH_TARGET, event = "stopped", "daemon stopped");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;
    use crate::sync::lock;

    /// Reporter recording event names for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingReporter {
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingReporter {
        pub(crate) fn events(&self) -> Vec<&'static str> {
            lock(&self.events).clone()
        }

        fn record(&self, event: &'static str) {
            lock(&self.events).push(event);
        }
    }

    impl HealthReporter for RecordingReporter {
        fn bootstrap_starting(&self) {
            self.record("bootstrap_starting");
        }

        fn bootstrap_succeeded(&self, _config: &Config) {
            self.record("bootstrap_succeeded");
        }

        fn bootstrap_failed(&self, _error: &BootstrapError) {
            self.record("bootstrap_failed");
        }

        fn listening(&self, _endpoint: &SocketEndpoint) {
            self.record("listening");
        }

        fn stopping(&self) {
            self.record("stopping");
        }

        fn stopped(&self) {
            self.record("stopped");
        }
    }
}
