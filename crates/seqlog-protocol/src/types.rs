//! Identifier and sequence-number types
//!
//! All identifiers are thin newtypes so that a `LogStreamId` can never be
//! passed where a `StorageNodeId` is expected. Sequence numbers reserve `0`
//! as the invalid value; the first valid position is `1`.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize,
            Deserialize,
        )]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Storage node identifier
    StorageNodeId,
    u32
);
define_id!(
    /// Topic identifier
    TopicId,
    u32
);
define_id!(
    /// Log stream identifier
    LogStreamId,
    u32
);

macro_rules! define_seq {
    ($(#[$meta:meta])* $name:ident) => {
        define_id!($(#[$meta])* $name, u64);

        impl $name {
            pub const INVALID: Self = Self(0);
            pub const MIN: Self = Self(1);

            pub const fn is_invalid(self) -> bool {
                self.0 == 0
            }

            /// Position `n` entries after this one
            pub const fn advance(self, n: u64) -> Self {
                Self(self.0 + n)
            }

            pub const fn saturating_sub(self, n: u64) -> Self {
                Self(self.0.saturating_sub(n))
            }
        }
    };
}

define_seq!(
    /// Global log sequence number, unique across a topic
    Glsn
);
define_seq!(
    /// Local log sequence number, dense within one log stream replica
    Llsn
);
define_seq!(
    /// Commit round identifier; each appended round advances it by one
    Version
);

impl Version {
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

/// Status of a single log stream replica, as reported by its storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplicaStatus {
    #[default]
    Running,
    Sealing,
    Sealed,
}

impl ReplicaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaStatus::Running => "running",
            ReplicaStatus::Sealing => "sealing",
            ReplicaStatus::Sealed => "sealed",
        }
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a log stream in the metadata repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LogStreamStatus {
    #[default]
    Running,
    Sealing,
    Sealed,
    Unsealing,
    Deleted,
}

impl LogStreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStreamStatus::Running => "running",
            LogStreamStatus::Sealing => "sealing",
            LogStreamStatus::Sealed => "sealed",
            LogStreamStatus::Unsealing => "unsealing",
            LogStreamStatus::Deleted => "deleted",
        }
    }

    /// Whether the log stream may receive non-empty commits
    pub fn is_running(&self) -> bool {
        matches!(self, LogStreamStatus::Running)
    }

    /// Sealing or Sealed
    pub fn is_sealed_or_sealing(&self) -> bool {
        matches!(self, LogStreamStatus::Sealing | LogStreamStatus::Sealed)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, LogStreamStatus::Deleted)
    }
}

impl fmt::Display for LogStreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TopicStatus {
    #[default]
    Running,
    Deleted,
}

/// Status of a storage node registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageNodeStatus {
    #[default]
    Running,
    Deleted,
}
