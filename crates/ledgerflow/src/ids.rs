//! Core identifier types shared across the engine.

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier of a single flow run.
///
/// A flow keeps its id across retries and restarts; only removal ends it.
///
/// # Example
///
/// ```
/// use ledgerflow::FlowId;
///
/// let id = FlowId::random();
/// assert_ne!(id, FlowId::random());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Generate a fresh random flow id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Borrow the underlying UUID.
    pub fn uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for FlowId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of one endpoint of a session between two flows.
///
/// Each side of a session has its own id; outbound traffic addresses the
/// peer's id once the session is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Build a session id from a raw value. Intended for tests and storage.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The raw numeric value, used when deriving deduplication seeds.
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A peer identity on the network.
///
/// Identity resolution is a collaborator concern; the engine only routes by
/// the well-known name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party(String);

impl Party {
    /// Create a party from its well-known name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the party name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Party {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// Identifier of a ledger transaction a flow may wait on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerTransactionId(String);

impl LedgerTransactionId {
    /// Create a transaction id from its hash string.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Borrow the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LedgerTransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque serialized payload.
///
/// The engine never inspects these bytes; the wire and checkpoint formats
/// belong to the serialization collaborator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SerializedBytes(pub Vec<u8>);

impl SerializedBytes {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Serialize any serde value into an opaque payload.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Deserialize the payload back into a serde value.
    pub fn to_value<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    /// Byte length of the payload.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SerializedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerializedBytes({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for SerializedBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_id_display_matches_uuid() {
        let id = FlowId::random();
        assert_eq!(format!("{}", id), id.uuid().to_string());
    }

    #[test]
    fn session_id_raw_round_trip() {
        let id = SessionId::from_raw(42);
        assert_eq!(id.to_raw(), 42);
    }

    #[test]
    fn serialized_bytes_value_round_trip() {
        let payload = SerializedBytes::from_value(&vec![1u32, 2, 3]).unwrap();
        let back: Vec<u32> = payload.to_value().unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn party_name() {
        let party = Party::new("O=Bank A, L=London, C=GB");
        assert_eq!(party.name(), "O=Bank A, L=London, C=GB");
    }
}
