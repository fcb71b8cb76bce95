//! The two participants of the hangout.
//!
//! Identity is pre-shared: there is no login, each client simply picks one
//! of the two names at startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    Zxhan,
    Anvi,
}

impl Identity {
    pub const ALL: [Identity; 2] = [Identity::Zxhan, Identity::Anvi];

    /// The other participant.
    pub fn peer(self) -> Identity {
        match self {
            Identity::Zxhan => Identity::Anvi,
            Identity::Anvi => Identity::Zxhan,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Identity::Zxhan => "Zxhan",
            Identity::Anvi => "Anvi",
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a name that is not one of the participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownIdentity(pub String);

impl fmt::Display for UnknownIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown identity: {}", self.0)
    }
}

impl std::error::Error for UnknownIdentity {}

impl FromStr for Identity {
    type Err = UnknownIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identity::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownIdentity(s.to_string()))
    }
}
