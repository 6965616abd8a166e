//! ciao-controller — instance lifecycle orchestration.
//!
//! Turns a launch request into a persisted instance plus the configuration
//! document a compute node needs to start it, and tears instances down again.
//!
//! # Architecture
//!
//! ```text
//! Controller
//!   ├── Datastore (tenants, workloads, instances, block devices, attachments)
//!   ├── Quotas (per-tenant admission)
//!   ├── VolumeService (external block storage)
//!   └── StateTracker (watch channels per instance)
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod network;
pub mod payload;
pub mod quotas;
pub mod state;
pub mod storage;

pub use config::ControllerConfig;
pub use controller::{Controller, LaunchRequest, LaunchResult};
pub use error::{ControllerError, ControllerResult, ErrorClass};
pub use storage::{MemoryVolumes, VolumeService};
