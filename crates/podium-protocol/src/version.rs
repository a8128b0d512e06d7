//! Schema version stamped into every event-log record.
//!
//! Records outlive the process that wrote them, so a reader checks the
//! writer's version before decoding the body. Minor bumps only add optional
//! fields; a major bump changes the layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version written by this build.
pub const SCHEMA_VERSION: Version = Version::new(1, 0);

/// A `major.minor` record schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Layout generation.
    pub major: u8,
    /// Additive revision within a layout.
    pub minor: u8,
}

impl Version {
    /// Create a version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a reader at `self` can decode a record written at `written`.
    /// Unknown optional fields of a newer minor are ignored.
    #[must_use]
    pub const fn reads(self, written: Version) -> bool {
        self.major == written.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
