//! Scripted actions run across devices, and expiry of finished runs.

mod runner;
mod template;
mod ttl;

pub use runner::DeviceJobRunner;
pub use template::{render_command, TemplateError};
pub use ttl::{is_expired, sweep_expired, TtlSweeper};
