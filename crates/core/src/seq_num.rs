use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Position of an event in the log: a `global` counter shared with the remote
/// authority plus a `client` counter for client-only events that follow the
/// same global predecessor. Ordered lexicographically by `(global, client)`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
pub struct SequenceNumber {
    global: u64,
    client: u64,
}

/// Component-wise difference between two sequence numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceDiff {
    pub global: i128,
    pub client: i128,
}

impl SequenceNumber {
    pub const ROOT: Self = Self {
        global: 0,
        client: 0,
    };

    pub const fn new(global: u64, client: u64) -> Self {
        Self { global, client }
    }

    pub const fn global_only(global: u64) -> Self {
        Self { global, client: 0 }
    }

    pub fn global(&self) -> u64 {
        self.global
    }

    pub fn client(&self) -> u64 {
        self.client
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    pub fn is_client_only(&self) -> bool {
        self.client > 0
    }

    /// The sequence number that follows this one. Client-only events bump the
    /// client counter; everything else advances `global` and resets `client`.
    pub fn next(&self, client_only: bool) -> Self {
        if client_only {
            Self::new(self.global, self.client + 1)
        } else {
            Self::new(self.global + 1, 0)
        }
    }

    /// Drops the client component, as seen by the remote authority.
    pub fn to_global(&self) -> Self {
        Self::global_only(self.global)
    }

    pub fn is_greater_than(&self, other: &Self) -> bool {
        self > other
    }

    pub fn diff(&self, other: &Self) -> SequenceDiff {
        SequenceDiff {
            global: i128::from(self.global) - i128::from(other.global),
            client: i128::from(self.client) - i128::from(other.client),
        }
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.global
            .cmp(&other.global)
            .then(self.client.cmp(&other.client))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.client == 0 {
            write!(f, "e{}", self.global)
        } else {
            write!(f, "e{}.{}", self.global, self.client)
        }
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceNumber({self})")
    }
}

impl FromStr for SequenceNumber {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('e')
            .ok_or_else(|| CoreError::InvalidSequenceNumber(s.to_string()))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| CoreError::InvalidSequenceNumber(s.to_string()))
        };
        match body.split_once('.') {
            Some((global, client)) => Ok(Self::new(parse(global)?, parse(client)?)),
            None => Ok(Self::global_only(parse(body)?)),
        }
    }
}
