//! # Node Identity
//!
//! A node is identified by a stable 128-bit random id, generated once per
//! process. The canonical encoding is 32 lowercase hex characters and is
//! used everywhere a peer id appears: announcements, signaling messages,
//! registry filenames, and logs.

use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A 128-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Canonical 32-char lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the canonical encoding.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(Error::Internal(format!(
                "node id must be 32 hex chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| Error::Internal(format!("invalid node id {s:?}: {e}")))?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Ok(NodeId(id))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NodeId::parse(s)
    }
}

// Serialized as the hex string so ids read naturally inside the JSON
// announcement and signaling shapes.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::parse(&s).map_err(de::Error::custom)
    }
}

// ============================================================================
// TESTS
// ============================================================================
