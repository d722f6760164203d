//! Device names of the form `<group>-<index>`.

use crate::NameError;

/// The name of a fleet member, split into its group prefix and ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceName<'a> {
    group: &'a str,
    ordinal: u32,
}

impl<'a> DeviceName<'a> {
    /// Builds a device name from a group and an ordinal.
    pub fn new(group: &'a str, ordinal: u32) -> Result<Self, NameError> {
        if group.is_empty() || group.ends_with('-') {
            return Err(NameError::InvalidGroup(group.to_string()));
        }
        Ok(Self { group, ordinal })
    }

    /// Parses `<group>-<index>`. The ordinal is whatever follows the last dash.
    pub fn parse(name: &'a str) -> Result<Self, NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        let Some((group, ordinal)) = name.rsplit_once('-') else {
            return Err(NameError::MissingOrdinal(name.to_string()));
        };
        let ordinal = parse_ordinal(name, ordinal)?;
        Self::new(group, ordinal)
    }

    pub fn group(&self) -> &'a str {
        self.group
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

impl std::fmt::Display for DeviceName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.group, self.ordinal)
    }
}

/// Returns the ordinal index encoded in a device name.
pub fn ordinal_of(name: &str) -> Result<u32, NameError> {
    DeviceName::parse(name).map(|n| n.ordinal())
}

/// Formats the name of the device at `ordinal` within `group`.
pub fn device_name(group: &str, ordinal: u32) -> String {
    format!("{group}-{ordinal}")
}

fn parse_ordinal(name: &str, ordinal: &str) -> Result<u32, NameError> {
    let invalid = || NameError::InvalidOrdinal {
        name: name.to_string(),
        ordinal: ordinal.to_string(),
    };
    if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    // Ordinals share the range of a signed 32-bit replica count.
    match ordinal.parse::<u32>() {
        Ok(n) if n <= i32::MAX as u32 => Ok(n),
        _ => Err(invalid()),
    }
}
