//! # Core Configuration Module
//!
//! Provides configuration management for the upload core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the host capabilities and runtime settings. Building
//! fails fast when a required capability is missing.
//!
//! ## Required Dependencies
//!
//! - `MessageTransport` - Outbound channel to the server
//!
//! ## Optional Dependencies (with defaults)
//!
//! - `Clock` - Time source (default: `SystemClock`)
//! - `LoggerSink` - Host log forwarding (default: none)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_traits::ChannelTransport;
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let (transport, outbound) = ChannelTransport::new();
//! let config = CoreConfig::builder()
//!     .transport(Arc::new(transport))
//!     .event_buffer_size(256)
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Panics with an actionable error: no transport was provided
//! let config = CoreConfig::builder()
//!     .build()
//!     .expect("Should fail - missing transport");
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{Clock, LoggerSink, MessageTransport, SystemClock};
use std::sync::Arc;

/// Largest accepted event bus capacity.
const MAX_EVENT_BUFFER_SIZE: usize = 65_536;

/// Core configuration for the upload core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Outbound server channel (required)
    pub transport: Arc<dyn MessageTransport>,

    /// Time source for task timestamps and stall detection
    pub clock: Arc<dyn Clock>,

    /// Host log forwarding (optional)
    pub logger_sink: Option<Arc<dyn LoggerSink>>,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,

    /// Feature flags
    pub features: FeatureFlags,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("transport", &"MessageTransport { ... }")
            .field("clock", &"Clock { ... }")
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .field("features", &self.features)
            .finish()
    }
}

/// Feature flags control optional behavior of the pipeline driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Request artwork import automatically when an artwork upload becomes
    /// ready for integration
    pub enable_artwork_import: bool,

    /// Run the stall watchdog alongside the notification router
    pub enable_stall_watchdog: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_artwork_import: true,
            enable_stall_watchdog: true,
        }
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Event buffer size is within `1..=65536`
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer_size > MAX_EVENT_BUFFER_SIZE {
            return Err(Error::Config(format!(
                "Event buffer size exceeds maximum of {}",
                MAX_EVENT_BUFFER_SIZE
            )));
        }

        Ok(())
    }
}

fn transport_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "MessageTransport".to_string(),
        message: "A MessageTransport implementation is required to reach the server. \
                 Desktop/Web: wrap the host socket connection. \
                 Tests: use bridge_traits::ChannelTransport."
            .to_string(),
    }
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Call [`build()`](CoreConfigBuilder::build) once all capabilities are set.
#[derive(Default)]
pub struct CoreConfigBuilder {
    transport: Option<Arc<dyn MessageTransport>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
    event_buffer_size: Option<usize>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the server transport (required).
    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the time source.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the host logger sink.
    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    /// Sets the event bus capacity.
    ///
    /// Default: [`DEFAULT_EVENT_BUFFER_SIZE`]
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Enables or disables the automatic artwork import request.
    ///
    /// Default: true
    pub fn enable_artwork_import(mut self, enabled: bool) -> Self {
        self.features.enable_artwork_import = enabled;
        self
    }

    /// Enables or disables the stall watchdog.
    ///
    /// Default: true
    pub fn enable_stall_watchdog(mut self, enabled: bool) -> Self {
        self.features.enable_stall_watchdog = enabled;
        self
    }

    /// Sets all feature flags at once.
    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Errors
    ///
    /// - [`Error::CapabilityMissing`] if no transport was provided
    /// - [`Error::Config`] if a value is out of range
    pub fn build(self) -> Result<CoreConfig> {
        let transport = self.transport.ok_or_else(transport_missing_error)?;

        let config = CoreConfig {
            transport,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}
