//! Shared types for the keep cache.

use serde::{Deserialize, Serialize};

// ─── KeepStatus ───────────────────────────────────────────────────────────────

/// Why a keep was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationCause {
    /// The keep never published a public key: key generation failed.
    KeygenFail,
    /// The most recent signature request was never fulfilled.
    SignatureFail,
    Other,
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeygenFail => write!(f, "KEYGEN_FAIL"),
            Self::SignatureFail => write!(f, "SIGNATURE_FAIL"),
            Self::Other => write!(f, "OTHER"),
        }
    }
}

/// Lifecycle status of a keep.
///
/// `timestamp` is the unix time (seconds) of the block holding the event
/// that defines the status: the creation block for `Active`, the earliest
/// `KeepClosed` / `KeepTerminated` event otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum KeepStatus {
    Active {
        #[serde(deserialize_with = "unix_timestamp")]
        timestamp: i64,
    },
    Closed {
        #[serde(deserialize_with = "unix_timestamp")]
        timestamp: i64,
    },
    Terminated {
        #[serde(deserialize_with = "unix_timestamp")]
        timestamp: i64,
        cause: TerminationCause,
    },
}

impl KeepStatus {
    /// The payload-free discriminant of this status.
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Active { .. } => StatusKind::Active,
            Self::Closed { .. } => StatusKind::Closed,
            Self::Terminated { .. } => StatusKind::Terminated,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Active { timestamp }
            | Self::Closed { timestamp }
            | Self::Terminated { timestamp, .. } => *timestamp,
        }
    }

    /// Returns `true` for `Closed` and `Terminated`.
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Returns `true` if replacing `self` with `next` respects the lifecycle:
    /// the kind is unchanged, or an `Active` keep becomes terminal.
    pub fn can_transition_to(&self, next: &KeepStatus) -> bool {
        self.kind() == next.kind() || (!self.is_terminal() && next.is_terminal())
    }
}

/// Status discriminant, used for filtering and change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Active,
    Closed,
    Terminated,
}

impl StatusKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

// ─── Keep ─────────────────────────────────────────────────────────────────────

/// A keep as observed in its creation event, before its details are fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepStub {
    pub address: String,
    /// Member addresses in the order the factory emitted them.
    pub members: Vec<String>,
    pub creation_block: u64,
}

/// A fully fetched, cached keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keep {
    /// Keep contract address (unique within the cache).
    pub address: String,
    /// Member addresses; fixed at creation.
    pub members: Vec<String>,
    /// Block holding the `BondedECDSAKeepCreated` event.
    pub creation_block: u64,
    /// Unix timestamp (seconds) at which the keep was opened.
    #[serde(deserialize_with = "unix_timestamp")]
    pub creation_timestamp: i64,
    pub status: KeepStatus,
}

impl Keep {
    pub fn from_stub(stub: KeepStub, creation_timestamp: i64, status: KeepStatus) -> Self {
        Self {
            address: stub.address,
            members: stub.members,
            creation_block: stub.creation_block,
            creation_timestamp,
            status,
        }
    }
}

// ─── Ledger wire types ───────────────────────────────────────────────────────

/// A block header, reduced to what the cache needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

/// An event log entry as returned by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub block_number: u64,
    /// Position of the log within its block.
    #[serde(default)]
    pub log_index: u32,
    /// Decoded event arguments, keyed by parameter name.
    pub return_values: serde_json::Value,
}

impl LedgerEvent {
    /// Canonical ledger position, `(block_number, log_index)`.
    pub fn position(&self) -> (u64, u32) {
        (self.block_number, self.log_index)
    }
}

/// Unix timestamps written by contract calls arrive as decimal strings;
/// block timestamps arrive as numbers. Both are accepted.
fn unix_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {s:?}: {e}"))),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
