//! droidfarm controller library
//!
//! Converges fleets of emulated Android devices toward their declared
//! state. A `Farm` names device groups; each group becomes a headless
//! Service and `count` Devices; each Device becomes a pod that is booted and
//! then bound to the farm's provider.
//!
//! ## Modules
//!
//! - `api`: object types stored in the control plane
//! - `store`: control-plane abstraction and the in-memory implementation
//! - `apply`: declarative create/update with creation-spec drift detection
//! - `concurrency`: ordered, bounded-width rollout admission
//! - `farm`: group orchestration and garbage collection
//! - `device`: device lifecycle and provider binding
//! - `jobs`: scripted actions across devices
//! - `adb`: device-control sessions
//! - `controller`: event-driven dispatch

pub mod adb;
pub mod api;
pub mod apply;
pub mod builders;
pub mod concurrency;
pub mod config;
pub mod controller;
pub mod device;
pub mod farm;
pub mod jobs;
pub mod registry;
pub mod resources;
pub mod store;

pub use controller::{Dispatcher, DispatcherConfig};
pub use device::DeviceReconciler;
pub use farm::FarmReconciler;
pub use jobs::DeviceJobRunner;
pub use store::{Client, ControlPlane, MemoryControlPlane};
