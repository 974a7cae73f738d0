//! Core type definitions for vbstore
//!
//! This module defines the vbucket identifiers and lifecycle states, the
//! closed set of outcome codes returned to callers, and the persisted
//! per-vbucket state record.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Numeric identifier of a vbucket (keyspace partition)
pub type VBucketId = u16;

/// Lifecycle state of a vbucket
#[derive(
    Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum VBucketState {
    /// Serves reads and accepts client mutations
    #[display("active")]
    Active = 1,
    /// Receives replicated mutations only
    #[display("replica")]
    Replica = 2,
    /// Defers client operations until the next state transition
    #[display("pending")]
    Pending = 3,
    /// Rejects everything
    #[default]
    #[display("dead")]
    Dead = 4,
}

impl VBucketState {
    /// Decode from the persisted numeric form
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Active),
            2 => Some(Self::Replica),
            3 => Some(Self::Pending),
            4 => Some(Self::Dead),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `to` is allowed
    ///
    /// Allowed: `dead -> active`, `active <-> replica`, `* -> pending` and
    /// `pending -> active | dead`. A vbucket is retired through `pending`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (a, b) if a as u8 == b as u8 => true,
            (_, Self::Pending)
            | (Self::Dead | Self::Replica | Self::Pending, Self::Active)
            | (Self::Active, Self::Replica)
            | (Self::Pending, Self::Dead) => true,
            _ => false,
        }
    }
}

/// Error returned when parsing a vbucket state name fails
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("unknown vbucket state: {_0}")]
pub struct ParseStateError(pub String);

impl std::error::Error for ParseStateError {}

impl FromStr for VBucketState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "replica" => Ok(Self::Replica),
            "pending" => Ok(Self::Pending),
            "dead" => Ok(Self::Dead),
            _ => Err(ParseStateError(s.to_string())),
        }
    }
}

/// Outcome code returned by every engine operation
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[display("success")]
    Success,
    #[display("key not found")]
    KeyNotFound,
    /// CAS mismatch or a key locked by another client
    #[display("key exists")]
    KeyExists,
    #[display("not stored")]
    NotStored,
    #[display("out of memory")]
    NoMemory,
    #[display("not my vbucket")]
    NotMyVBucket,
    /// The operation continues in the background; the requester is notified
    #[display("would block")]
    WouldBlock,
    #[display("temporary failure")]
    TempFail,
    #[display("out of range")]
    OutOfRange,
    #[display("invalid arguments")]
    Invalid,
}

impl Status {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Operation carried by a queued mutation
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueOp {
    #[display("set")]
    Set,
    #[display("del")]
    Del,
}

/// Per-vbucket state record written by the snapshot task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedVBucketState {
    /// Lifecycle state at snapshot time
    pub state: VBucketState,
    /// Last checkpoint id whose mutations were all persisted
    pub checkpoint_id: u64,
    /// Highest sequence number of a persisted deletion
    pub max_deleted_seqno: u64,
}

impl PersistedVBucketState {
    #[must_use]
    pub const fn new(state: VBucketState, checkpoint_id: u64) -> Self {
        Self {
            state,
            checkpoint_id,
            max_deleted_seqno: 0,
        }
    }
}
