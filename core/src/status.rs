//! Sign status and the legal-transition table.
//!
//! The set of statuses is closed: there is no runtime registry and no fuzzy
//! string lookup. Parsing accepts exactly the names produced by [`SignStatus::as_str`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a status name is not one of the known statuses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown sign status: {0}")]
pub struct UnknownStatus(String);

/// Lifecycle status of a sign.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignStatus {
    /// Registered and free for allocation.
    New,
    /// Reserved against an order line item.
    Process,
    /// Order line fulfilled (sold/used).
    Done,
    /// Written off administratively.
    Decommission,
    /// Returned stock, staged before becoming available again.
    Return,
    /// Administratively retired.
    Delete,
    /// Unrecoverable inconsistency.
    Error,
}

impl SignStatus {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::New,
        Self::Process,
        Self::Done,
        Self::Decommission,
        Self::Return,
        Self::Delete,
        Self::Error,
    ];

    /// Storage/wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Process => "process",
            Self::Done => "done",
            Self::Decommission => "decommission",
            Self::Return => "return",
            Self::Delete => "delete",
            Self::Error => "error",
        }
    }

    /// Parse a status from its storage name.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStatus`] if the string doesn't match a known status exactly.
    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "new" => Ok(Self::New),
            "process" => Ok(Self::Process),
            "done" => Ok(Self::Done),
            "decommission" => Ok(Self::Decommission),
            "return" => Ok(Self::Return),
            "delete" => Ok(Self::Delete),
            "error" => Ok(Self::Error),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }

    /// Terminal statuses never transition automatically.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delete | Self::Error)
    }

    /// Statuses in which the sign is linked to an order line item.
    #[must_use]
    pub const fn carries_order(self) -> bool {
        matches!(self, Self::Process | Self::Done)
    }

    /// The legal-transition table.
    ///
    /// Self-transitions are not part of the table; status-preserving amendments
    /// are handled separately by the planner.
    ///
    /// # Examples
    ///
    /// ```
    /// use marksign_core::status::SignStatus;
    ///
    /// assert!(SignStatus::New.can_transition_to(SignStatus::Process));
    /// assert!(SignStatus::Done.can_transition_to(SignStatus::New));
    /// assert!(!SignStatus::New.can_transition_to(SignStatus::Done));
    /// assert!(!SignStatus::Error.can_transition_to(SignStatus::New));
    /// ```
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        use SignStatus::{Decommission, Delete, Done, Error, New, Process, Return};

        match (self, target) {
            (New, Process | Decommission | Return | Delete | Error)
            | (Process, Done | New | Return | Delete | Error)
            | (Done, New | Decommission | Return | Delete | Error)
            | (Decommission, New | Return | Delete | Error)
            | (Return, New | Delete | Error) => true,
            (New, New)
            | (New, Done)
            | (Process, Process | Decommission)
            | (Done, Done | Process)
            | (Decommission, Process | Done | Decommission)
            | (Return, Process | Done | Decommission | Return)
            | (Delete | Error, _) => false,
        }
    }
}

impl fmt::Display for SignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
