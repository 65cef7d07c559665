//! Tri-store presence model.
//!
//! Every event may have bytes on the originating device, in the transfer
//! (drop) store and in the local archive. Each location is observed
//! independently and reported as one of three states; `Unknown` means the
//! store could not be asked and is never evidence that a copy is gone.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
    Unknown,
}

impl Presence {
    pub fn from_exists(exists: bool) -> Self {
        if exists {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    pub fn is_present(self) -> bool {
        self == Presence::Present
    }

    pub fn is_absent(self) -> bool {
        self == Presence::Absent
    }

    pub fn is_known(self) -> bool {
        self != Presence::Unknown
    }
}

impl Default for Presence {
    fn default() -> Self {
        Presence::Unknown
    }
}

impl Display for Presence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Presence::Present => write!(f, "present"),
            Presence::Absent => write!(f, "absent"),
            Presence::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Presence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Presence::Present),
            "absent" => Ok(Presence::Absent),
            "unknown" => Ok(Presence::Unknown),
            other => Err(format!("unknown presence value '{}'", other)),
        }
    }
}

/// Where an event's bytes currently exist
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PresenceVector {
    pub device: Presence,
    pub transfer: Presence,
    pub local: Presence,
}

impl PresenceVector {
    pub fn new(device: Presence, transfer: Presence, local: Presence) -> Self {
        Self {
            device,
            transfer,
            local,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    /// The transfer store holds a copy the archive does not.
    pub fn needs_ingest(&self) -> bool {
        self.transfer.is_present() && self.local.is_absent()
    }

    /// All three stores positively report no copy.
    pub fn is_fully_absent(&self) -> bool {
        self.device.is_absent() && self.transfer.is_absent() && self.local.is_absent()
    }

    /// Fill `Unknown` components from an earlier observation so a stored
    /// snapshot keeps showing the last good value of an unreachable store.
    pub fn with_last_good(self, previous: &PresenceVector) -> Self {
        fn pick(now: Presence, before: Presence) -> Presence {
            if now.is_known() {
                now
            } else {
                before
            }
        }

        Self {
            device: pick(self.device, previous.device),
            transfer: pick(self.transfer, previous.transfer),
            local: pick(self.local, previous.local),
        }
    }
}

impl Display for PresenceVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(device={}, transfer={}, local={})",
            self.device, self.transfer, self.local
        )
    }
}

/// Collapsed view of a presence vector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    CameraOnly,
    TransferPending,
    FullyMirrored,
    LocalOnly,
    Orphaned,
    Purged,
}

impl LifecycleState {
    /// Derive the lifecycle state. Returns `None` when the known components
    /// are all absent but at least one store is unknown, since that cannot
    /// be told apart from `Purged`.
    pub fn from_presence(presence: &PresenceVector, orphaned: bool) -> Option<Self> {
        let PresenceVector {
            device,
            transfer,
            local,
        } = *presence;

        if local.is_present() {
            return Some(if device.is_present() {
                LifecycleState::FullyMirrored
            } else {
                LifecycleState::LocalOnly
            });
        }

        if transfer.is_present() {
            return Some(if orphaned && !device.is_present() {
                LifecycleState::Orphaned
            } else {
                LifecycleState::TransferPending
            });
        }

        if device.is_present() {
            return Some(LifecycleState::CameraOnly);
        }

        if presence.is_fully_absent() {
            return Some(LifecycleState::Purged);
        }

        None
    }
}
