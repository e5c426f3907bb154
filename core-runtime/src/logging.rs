//! # Logging
//!
//! Installs the process-wide `tracing` subscriber. Three pieces are stacked
//! on a [`Registry`]:
//!
//! 1. a `fmt` output layer in the selected [`LogFormat`], writing to stdout
//! 2. an [`EnvFilter`] built from [`LoggingConfig::level`] or explicit directives
//! 3. a forwarding layer that mirrors events to the host's [`LoggerSink`]
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use bridge_traits::{LogLevel, StderrSink};
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Compact)
//!         .with_level(LogLevel::Debug)
//!         .with_logger_sink(Arc::new(StderrSink::default())),
//! )?;
//! ```
//!
//! Fields forwarded to the sink pass through [`redact_if_sensitive`] unless
//! redaction is switched off. Hex chunk payloads never reach the host log.

use crate::error::{Error, Result};

use bridge_traits::{LogEntry, LogLevel, LoggerSink};

use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Replacement text for masked values.
pub const REDACTED: &str = "[REDACTED]";

/// Crates filtered at the configured level when no directives are given.
const OWN_CRATES: [&str; 5] = [
    "bridge_traits",
    "core_runtime",
    "core_upload",
    "core_service",
    "mdb_workspace",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// One JSON object per line
    Json,
    /// Single-line text
    Compact,
}

impl Default for LogFormat {
    /// JSON for release builds or with the `json-logs` feature, pretty otherwise.
    fn default() -> Self {
        if cfg!(any(feature = "json-logs", not(debug_assertions))) {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// `EnvFilter` directives; replaces the level-derived filter entirely
    pub directives: Option<String>,
    pub sink: Option<Arc<dyn LoggerSink>>,
    pub redact: bool,
    /// Log span creation and close
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            directives: None,
            sink: None,
            redact: true,
            span_events: false,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("directives", &self.directives)
            .field("sink", &self.sink.is_some())
            .field("redact", &self.redact)
            .field("span_events", &self.span_events)
            .finish()
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// e.g. `"core_upload=trace,core_runtime=debug"`
    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact = redact;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let directives = match &self.directives {
            Some(custom) => custom.clone(),
            None => default_directives(self.level),
        };
        EnvFilter::try_new(&directives)
            .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
    }
}

fn default_directives(level: LogLevel) -> String {
    OWN_CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .chain(["tokio=warn".to_string(), "runtime=warn".to_string()])
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber.
///
/// # Errors
///
/// [`Error::Config`] for bad filter directives, [`Error::Logging`] when a
/// global subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;

    tracing_subscriber::registry()
        .with(output_layer(&config))
        .with(filter)
        .with(SinkForwarder::new(config.sink.clone(), config.redact))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

fn output_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let spans = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_span_events(spans);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
    }
}

// ============================================================================
// Host forwarding
// ============================================================================

struct SinkForwarder {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl SinkForwarder {
    fn new(sink: Option<Arc<dyn LoggerSink>>, redact: bool) -> Self {
        Self { sink, redact }
    }

    fn entry_for(&self, event: &Event<'_>, level: LogLevel) -> LogEntry {
        let metadata = event.metadata();
        let mut collected = FieldCollector::default();
        event.record(&mut collected);

        let message = collected
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());
        let mut entry = LogEntry::new(level, metadata.target(), message);
        for (name, value) in collected.fields {
            let value = match self.redact {
                true => redact_if_sensitive(&name, &value),
                false => value,
            };
            entry.fields.insert(name, value);
        }
        entry
    }
}

impl<S> Layer<S> for SinkForwarder
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = &self.sink else {
            return;
        };
        let level = log_level(*event.metadata().level());
        if level < sink.min_level() {
            return;
        }

        let mut entry = self.entry_for(event, level);
        entry.span = ctx.event_span(event).map(|span| span.name().to_string());

        deliver(Arc::clone(sink), entry);
    }
}

/// Hand the entry to the sink without blocking a runtime worker.
fn deliver(sink: Arc<dyn LoggerSink>, entry: LogEntry) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = sink.log(entry).await {
                    eprintln!("logger sink rejected entry: {}", e);
                }
            });
        }
        Err(_) => {
            if let Err(e) = futures::executor::block_on(sink.log(entry)) {
                eprintln!("logger sink rejected entry: {}", e);
            }
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldCollector {
    fn push(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            name => self.fields.push((name.to_string(), value)),
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_owned());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }
}

fn log_level(level: Level) -> LogLevel {
    if level == Level::ERROR {
        LogLevel::Error
    } else if level == Level::WARN {
        LogLevel::Warn
    } else if level == Level::INFO {
        LogLevel::Info
    } else if level == Level::DEBUG {
        LogLevel::Debug
    } else {
        LogLevel::Trace
    }
}

// ============================================================================
// Redaction
// ============================================================================

enum Sensitivity {
    Secret,
    Path,
    Plain,
}

fn classify(field_name: &str) -> Sensitivity {
    const SECRETS: [&str; 8] = [
        "chunkdata",
        "payload",
        "token",
        "password",
        "secret",
        "api_key",
        "authorization",
        "bearer",
    ];

    let name = field_name.to_ascii_lowercase();
    if SECRETS.iter().any(|secret| name.contains(secret)) {
        Sensitivity::Secret
    } else if name.ends_with("path") || name == "file" {
        Sensitivity::Path
    } else {
        Sensitivity::Plain
    }
}

/// Mask `value` according to what `field_name` says it holds.
///
/// Payloads and credentials become [`REDACTED`], path fields keep only the
/// file name and e-mail addresses keep their first character.
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    match classify(field_name) {
        Sensitivity::Secret => REDACTED.to_string(),
        Sensitivity::Path => strip_path(value).to_string(),
        Sensitivity::Plain => match value.split_once('@') {
            Some((user, domain)) if domain.contains('.') => {
                let first: String = user.chars().take(1).collect();
                format!("{}***@{}", first, REDACTED)
            }
            _ => value.to_string(),
        },
    }
}

/// Last component of a `/` or `\` separated path.
pub fn strip_path(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as SinkResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingSink {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LoggerSink for CapturingSink {
        async fn log(&self, entry: LogEntry) -> SinkResult<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }

        fn min_level(&self) -> LogLevel {
            LogLevel::Debug
        }
    }

    fn capture(redact: bool) -> (Arc<CapturingSink>, tracing::subscriber::DefaultGuard) {
        let sink = Arc::new(CapturingSink::default());
        let forwarder = SinkForwarder::new(Some(sink.clone() as Arc<dyn LoggerSink>), redact);
        let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(forwarder));
        (sink, guard)
    }

    #[test]
    fn test_default_directives_cover_own_crates() {
        let directives = default_directives(LogLevel::Debug);
        assert!(directives.contains("core_upload=debug"));
        assert!(directives.contains("core_service=debug"));
        assert!(directives.ends_with("tokio=warn,runtime=warn"));
    }

    #[test]
    fn test_explicit_directives_win() {
        let config = LoggingConfig::default()
            .with_level(LogLevel::Error)
            .with_directives("core_upload=trace");
        let filter = config.env_filter().unwrap().to_string();
        assert!(filter.contains("core_upload=trace"));
        assert!(!filter.contains("core_runtime"));
    }

    #[test]
    fn test_bad_directives_rejected() {
        let config = LoggingConfig::default().with_directives("core_upload=loud");
        assert!(matches!(config.env_filter(), Err(Error::Config(_))));
    }

    #[test]
    fn test_forwarder_builds_entry() {
        let (sink, _guard) = capture(false);

        let span = tracing::info_span!("router");
        span.in_scope(|| {
            tracing::info!(target: "core_upload::router", task_id = "abc", offset = 4u64, "chunk sent");
        });

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, "core_upload::router");
        assert_eq!(entries[0].message, "chunk sent");
        assert_eq!(entries[0].field("task_id"), Some("abc"));
        assert_eq!(entries[0].field("offset"), Some("4"));
        assert_eq!(entries[0].span.as_deref(), Some("router"));
    }

    #[test]
    fn test_forwarder_masks_payload_and_skips_trace() {
        let (sink, _guard) = capture(true);

        tracing::debug!(chunkdata = "00ff00ff", sourcepath = "/srv/up/cover.jpg", "sending");
        tracing::trace!("below sink threshold");

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("chunkdata"), Some(REDACTED));
        assert_eq!(entries[0].field("sourcepath"), Some("cover.jpg"));
    }

    #[test]
    fn test_email_masking() {
        assert_eq!(
            redact_if_sensitive("owner", "user@example.com"),
            "u***@[REDACTED]"
        );
        assert_eq!(redact_if_sensitive("owner", "not-an-address@"), "not-an-address@");
    }

    #[test]
    fn test_strip_path_edges() {
        assert_eq!(strip_path("/var/log/"), "");
        assert_eq!(strip_path("a\\b/c.flac"), "c.flac");
    }
}
