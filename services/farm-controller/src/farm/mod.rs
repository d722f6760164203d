//! Farm orchestration: turns a Farm's groups into Devices and collects the
//! ones no group accounts for.

mod gc;
mod reconciler;

pub use gc::{collect_reason, run_gc, GcReason};
pub use reconciler::FarmReconciler;
