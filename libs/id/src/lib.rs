//! # droidfarm-id
//!
//! Object identity for the droidfarm controller.
//!
//! ## Naming
//!
//! - Every control-plane object is addressed by an [`ObjectKey`]
//!   (namespace + name; cluster-scoped objects have an empty namespace).
//! - Fleet members are named `<group>-<index>`. The group prefix is fixed for
//!   the lifetime of the group and the index is the device's ordinal, which
//!   drives ordered rollout and scale-down.
//!
//! ```
//! use droidfarm_id::{device_name, DeviceName};
//!
//! let name = device_name("pixel", 4);
//! let parsed = DeviceName::parse(&name).unwrap();
//! assert_eq!(parsed.group(), "pixel");
//! assert_eq!(parsed.ordinal(), 4);
//! ```

mod error;
mod key;
mod name;

pub use error::NameError;
pub use key::ObjectKey;
pub use name::{device_name, ordinal_of, DeviceName};
