//! Per-device lifecycle: pod, boot detection, provider binding.

mod binding;
mod reconciler;

pub use binding::bind_to_provider;
pub use reconciler::{resolve_config, DeviceReconciler};
