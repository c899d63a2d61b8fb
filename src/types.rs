//! Core identity and versioning types.
//!
//! A shard coordinate is the tuple (scope, node, edge types). Versions are
//! time-ordered and globally unique: a wall-clock millisecond component
//! tie-broken by a process-local sequence. Both the write timestamp of an
//! edge and the time axis of shard routing use the same `Version` type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

// ── Scope ──────────────────────────────────────────────────────────

/// Organization/application identity namespacing every shard and index
/// lookup. Opaque to this crate: only compared and hashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub organization: String,
    pub application: String,
}

impl ScopeKey {
    pub fn new(organization: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            application: application.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.application)
    }
}

// ── Node Identity ──────────────────────────────────────────────────

/// Graph node identity. Derived from an external name via BLAKE3 so the
/// same logical entity always maps to the same id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u128);

impl NodeId {
    /// Derive a node id from an external name.
    pub fn from_name(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let raw = u128::from_le_bytes(hash.as_bytes()[0..16].try_into().unwrap());
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

// ── Version ────────────────────────────────────────────────────────

/// Time-ordered, globally-unique version value.
///
/// Total order is by timestamp, tie-broken by sequence (the derived
/// lexicographic `Ord` on the field order below).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    pub timestamp_ms: u64,
    pub seq: u64,
}

impl Version {
    /// Origin of the version axis. The implicit default shard starts here.
    pub const ZERO: Version = Version {
        timestamp_ms: 0,
        seq: 0,
    };

    /// Largest representable version; useful as an unbounded scan ceiling.
    pub const MAX: Version = Version {
        timestamp_ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(timestamp_ms: u64, seq: u64) -> Self {
        Self { timestamp_ms, seq }
    }

    /// Build a version from caller-supplied raw values, rejecting negatives
    /// before any query is issued.
    pub fn from_raw(timestamp_ms: i64, seq: i64) -> Result<Self> {
        if timestamp_ms < 0 || seq < 0 {
            return Err(GraphError::IllegalVersion(format!(
                "negative component in ({}, {})",
                timestamp_ms, seq
            )));
        }
        Ok(Self {
            timestamp_ms: timestamp_ms as u64,
            seq: seq as u64,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.timestamp_ms, self.seq)
    }
}

/// Mints time-ordered unique versions: wall-clock millis plus a
/// process-local sequence for uniqueness within a millisecond.
pub struct VersionFactory {
    seq: AtomicU64,
}

impl VersionFactory {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Mint the next version at the current wall clock.
    pub fn next(&self) -> Version {
        Version {
            timestamp_ms: now_ms(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Mint a version at an explicit timestamp (skewed-writer simulation,
    /// replay, tests).
    pub fn next_at(&self, timestamp_ms: u64) -> Version {
        Version {
            timestamp_ms,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for VersionFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall clock in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Coordinate ─────────────────────────────────────────────────────

/// The tuple keying a shard group: (scope, node, edge types).
///
/// Edge types are kept sorted so that the same logical coordinate always
/// compares, hashes, and row-keys identically regardless of argument order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub scope: ScopeKey,
    pub node: NodeId,
    edge_types: Vec<String>,
}

impl Coordinate {
    pub fn new(scope: ScopeKey, node: NodeId, edge_types: &[&str]) -> Self {
        let mut edge_types: Vec<String> = edge_types.iter().map(|s| s.to_string()).collect();
        edge_types.sort();
        Self {
            scope,
            node,
            edge_types,
        }
    }

    pub fn edge_types(&self) -> &[String] {
        &self.edge_types
    }

    /// Substrate row key: BLAKE3 over the canonical rendering of the tuple.
    /// Shard group records persist under this key, each shard keyed
    /// additionally by its start version.
    pub fn row_key(&self) -> u128 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.scope.organization.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.scope.application.as_bytes());
        hasher.update(b"\0");
        hasher.update(&self.node.0.to_le_bytes());
        for et in &self.edge_types {
            hasher.update(b"\0");
            hasher.update(et.as_bytes());
        }
        let hash = hasher.finalize();
        u128::from_le_bytes(hash.as_bytes()[0..16].try_into().unwrap())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:[{}]", self.scope, self.node, self.edge_types.join(","))
    }
}
