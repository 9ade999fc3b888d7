//! Structured telemetry initialisation for the daemon.
//!
//! Besides the stderr sink, the subscriber carries [`PetitionLogLayer`],
//! which copies events into the output buffer of the petition running on
//! the emitting thread whenever that petition asked for a log level.

use std::fmt::{self, Write as _};
use std::io::{self, IsTerminal};

use cmdhub_config::{Config, LogFormat};
use once_cell::sync::OnceCell;
use tracing::field::{Field, Visit};
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tracing_fmt};

use crate::context;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Configures the global tracing subscriber when invoked for the first time.
///
/// Repeated calls are idempotent: only the first installs the subscriber.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let stderr: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format() {
        LogFormat::Json => tracing_fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(io::stderr)
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => tracing_fmt::layer()
            .compact()
            .with_writer(io::stderr)
            // Colour only on interactive terminals.
            .with_ansi(io::stderr().is_terminal())
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    let petitions = PetitionLogLayer.with_filter(filter_fn(|metadata| {
        context::redirects(metadata.level())
    }));

    let subscriber = Registry::default().with(stderr).with(petitions);
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

/// Renders events into the current petition's output buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PetitionLogLayer;

impl<S: Subscriber> Layer<S> for PetitionLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut line = format!("[{}] ", event.metadata().level());
        event.record(&mut LineVisitor { line: &mut line });
        line.push('\n');
        context::append_log_line(line.as_bytes());
    }
}

struct LineVisitor<'a> {
    line: &'a mut String,
}

impl Visit for LineVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.line.push_str(value);
        } else {
            let _ = write!(self.line, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?}");
        } else {
            let _ = write!(self.line, " {}={value:?}", field.name());
        }
    }
}
