//! Core service façade and bootstrap helpers.
//!
//! This crate wires the host-provided capabilities from a [`CoreConfig`]
//! (server transport, clock, log sink) into the upload pipeline. Hosts build
//! a [`CoreService`], call [`CoreService::start`] once, and forward every
//! server notification into the returned channel.
//!
//! ```ignore
//! use bridge_traits::ChannelTransport;
//! use core_runtime::config::CoreConfig;
//! use core_service::CoreService;
//! use core_upload::UploadConfig;
//!
//! let (transport, mut outbound) = ChannelTransport::new();
//! let config = CoreConfig::builder().transport(Arc::new(transport)).build()?;
//!
//! let core = CoreService::new(config, UploadConfig::default())?;
//! let notifications = core.start().await?;
//!
//! // Host socket loop: send `outbound` messages, feed incoming ones to `notifications`
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::RawNotification;
use core_runtime::config::CoreConfig;
use core_runtime::events::{EventBus, EventStream};
use core_runtime::logging::LoggingConfig;
use core_upload::{NotificationRouter, UploadConfig, UploadManager};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ServiceInner {
    config: CoreConfig,
    events: EventBus,
    manager: Arc<UploadManager>,
    router: Arc<NotificationRouter>,
    cancel: CancellationToken,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<ServiceInner>,
}

impl CoreService {
    /// Create a new service. Nothing runs until [`start`](Self::start).
    pub fn new(config: CoreConfig, upload: UploadConfig) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_buffer_size);
        let manager = Arc::new(UploadManager::new(
            Arc::clone(&config.transport),
            Arc::clone(&config.clock),
            events.clone(),
            upload,
        )?);
        let router = Arc::new(
            NotificationRouter::new(
                Arc::clone(manager.registry()),
                Arc::clone(&config.transport),
                events.clone(),
            )
            .with_artwork_import(config.features.enable_artwork_import),
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                events,
                manager,
                router,
                cancel: CancellationToken::new(),
                workers: Mutex::new(None),
            }),
        })
    }

    /// Install the global tracing subscriber, forwarding to the configured
    /// [`LoggerSink`](bridge_traits::LoggerSink) if there is one.
    pub fn init_logging(&self, logging: LoggingConfig) -> Result<()> {
        let logging = match &self.inner.config.logger_sink {
            Some(sink) => logging.with_logger_sink(Arc::clone(sink)),
            None => logging,
        };
        core_runtime::logging::init_logging(logging)?;
        Ok(())
    }

    /// Spawn the notification router and, if enabled, the stall watchdog.
    ///
    /// Returns the sender hosts push server notifications into.
    ///
    /// # Errors
    ///
    /// [`CoreError::InitializationFailed`] outside a Tokio runtime, after
    /// shutdown, or when called twice.
    pub async fn start(&self) -> Result<mpsc::Sender<RawNotification>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CoreError::InitializationFailed(
                "CoreService::start requires a Tokio runtime".to_string(),
            ));
        }
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::InitializationFailed(
                "Core service has been shut down".to_string(),
            ));
        }

        let mut workers = self.inner.workers.lock().await;
        if workers.is_some() {
            return Err(CoreError::InitializationFailed(
                "Core service already started".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.inner.manager.config().notification_buffer_size);
        let mut handles = vec![tokio::spawn(
            Arc::clone(&self.inner.router).run(rx, self.inner.cancel.child_token()),
        )];

        if self.inner.config.features.enable_stall_watchdog {
            handles.push(
                Arc::clone(&self.inner.manager).spawn_watchdog(self.inner.cancel.child_token()),
            );
        }

        info!(workers = handles.len(), "Core service started");
        *workers = Some(handles);
        Ok(tx)
    }

    /// Stop background workers and wait for them to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();

        let handles = self.inner.workers.lock().await.take().unwrap_or_default();
        for handle in handles {
            handle
                .await
                .map_err(|e| core_runtime::Error::Task(e.to_string()))?;
        }
        debug!("Core service stopped");
        Ok(())
    }

    pub fn manager(&self) -> Arc<UploadManager> {
        Arc::clone(&self.inner.manager)
    }

    pub fn router(&self) -> Arc<NotificationRouter> {
        Arc::clone(&self.inner.router)
    }

    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.stream()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for CoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
