//! Opaque pagination cursors.
//!
//! A cursor carries one pipeline stage's resume state across a client
//! round-trip: an integer offset for index-search stages, a version for
//! graph-edge stages. The wire token is a format-version byte followed by
//! the bincode payload, base64-encoded. The payload enum's discriminant is
//! the stage discriminator: a token minted by one stage kind is rejected
//! by the other, never silently misapplied.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::types::Version;

/// Wire format version byte.
const CURSOR_FORMAT_VERSION: u8 = 1;

// ── Cursor Token ───────────────────────────────────────────────────

/// Opaque resume token. Stable across a client round-trip: returned in
/// one response, supplied verbatim in the next request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Payload ────────────────────────────────────────────────────────

/// Stage-scoped payload. Components are signed on the wire so that a
/// corrupted or hostile token fails the bounds check instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CursorPayload {
    /// Index-search stage: next result offset.
    SearchOffset(i64),
    /// Graph-edge stage: last yielded version.
    EdgeVersion { timestamp_ms: i64, seq: i64 },
}

impl CursorPayload {
    fn stage(&self) -> &'static str {
        match self {
            CursorPayload::SearchOffset(_) => "search",
            CursorPayload::EdgeVersion { .. } => "edge",
        }
    }
}

fn encode_payload(payload: &CursorPayload) -> Result<Cursor> {
    let mut bytes = vec![CURSOR_FORMAT_VERSION];
    bytes.extend(bincode::serialize(payload)?);
    Ok(Cursor(URL_SAFE_NO_PAD.encode(bytes)))
}

fn decode_payload(cursor: &Cursor, expected_stage: &'static str) -> Result<CursorPayload> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.as_str())
        .map_err(|e| GraphError::InvalidCursor(format!("not a cursor token: {}", e)))?;

    let (&version, payload_bytes) = bytes
        .split_first()
        .ok_or_else(|| GraphError::InvalidCursor("empty cursor token".to_string()))?;
    if version != CURSOR_FORMAT_VERSION {
        return Err(GraphError::InvalidCursor(format!(
            "unsupported cursor format version {}",
            version
        )));
    }

    let payload: CursorPayload = bincode::deserialize(payload_bytes)
        .map_err(|e| GraphError::InvalidCursor(format!("malformed cursor payload: {}", e)))?;

    if payload.stage() != expected_stage {
        return Err(GraphError::InvalidCursor(format!(
            "cursor minted by a {} stage presented to a {} stage",
            payload.stage(),
            expected_stage
        )));
    }
    Ok(payload)
}

// ── Codecs ─────────────────────────────────────────────────────────

/// Per-stage cursor serialization. Each filter kind exposes exactly one
/// codec; decoding checks the stage discriminator and bounds before any
/// query is issued.
pub trait CursorCodec: Send + Sync {
    type Seek;

    fn stage(&self) -> &'static str;
    fn encode(&self, seek: &Self::Seek) -> Result<Cursor>;
    fn decode(&self, cursor: &Cursor) -> Result<Self::Seek>;
}

/// Codec for index-search stages: the seek state is a result offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchCursorCodec;

impl CursorCodec for SearchCursorCodec {
    type Seek = usize;

    fn stage(&self) -> &'static str {
        "search"
    }

    fn encode(&self, seek: &usize) -> Result<Cursor> {
        encode_payload(&CursorPayload::SearchOffset(*seek as i64))
    }

    fn decode(&self, cursor: &Cursor) -> Result<usize> {
        match decode_payload(cursor, self.stage())? {
            CursorPayload::SearchOffset(offset) if offset >= 0 => Ok(offset as usize),
            CursorPayload::SearchOffset(offset) => Err(GraphError::InvalidCursor(format!(
                "negative offset {}",
                offset
            ))),
            other => Err(GraphError::InvalidCursor(format!(
                "unexpected {} payload",
                other.stage()
            ))),
        }
    }
}

/// Codec for graph-edge stages: the seek state is a version.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeCursorCodec;

impl CursorCodec for EdgeCursorCodec {
    type Seek = Version;

    fn stage(&self) -> &'static str {
        "edge"
    }

    fn encode(&self, seek: &Version) -> Result<Cursor> {
        encode_payload(&CursorPayload::EdgeVersion {
            timestamp_ms: seek.timestamp_ms as i64,
            seq: seek.seq as i64,
        })
    }

    fn decode(&self, cursor: &Cursor) -> Result<Version> {
        match decode_payload(cursor, self.stage())? {
            CursorPayload::EdgeVersion { timestamp_ms, seq } => {
                Version::from_raw(timestamp_ms, seq).map_err(|_| {
                    GraphError::InvalidCursor(format!(
                        "out-of-range version ({}, {})",
                        timestamp_ms, seq
                    ))
                })
            }
            other => Err(GraphError::InvalidCursor(format!(
                "unexpected {} payload",
                other.stage()
            ))),
        }
    }
}
