//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (`core-service`, `core-upload`). Host applications can
//! depend on `mdb-workspace` and enable the documented features without
//! needing to wire each crate individually.

#[cfg(feature = "service")]
pub use core_service::{CoreError, CoreService};

#[cfg(feature = "service")]
pub use core_upload as upload;
