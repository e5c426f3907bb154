//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the upload core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the upload pipeline and the
//! service façade depend on. It establishes the logging conventions, the
//! fail-fast configuration of host capabilities and the event broadcasting
//! used by observers.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
