//! Wire messages and their encodings
//!
//! Messages are plain serde types. JSON (text) and bincode (binary) are two
//! encodings of the same structures; which one a session uses is a transport
//! decision.
//!
//! JSON shapes are untagged so viewers dispatch on the fields present
//! (`full`, `updated`, `events`, `nonce`, ...). Binary frames carry a variant
//! index instead, since bincode is not self-describing.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::error::{DecodeError, EncodeError};
use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::game::state::{ArenaMeta, EntityId, EntityKind, EntityRecord, EntityRef};
use crate::net::delta::ReplicationSnapshot;
use crate::util::vec2::Vec2;

/// Encoding or decoding failure
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary encode: {0}")]
    Encode(#[from] EncodeError),
    #[error("binary decode: {0}")]
    Decode(#[from] DecodeError),
}

/// Milliseconds since the Unix epoch
pub fn server_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Client -> server
// ============================================================================

/// Messages from viewer to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Claimed position of the viewer's own actor
    Move { x: f32, y: f32 },
    /// Answer to a latency probe
    Pong { nonce: u64 },
}

// ============================================================================
// Server -> client
// ============================================================================

/// Full state: `{ [kind]: { [id]: record }, wave, walls, arenaFlags, full: true, serverTime }`
#[derive(Debug, Clone, Copy)]
pub struct FullSnapshot<'a> {
    pub snapshot: &'a ReplicationSnapshot,
    pub server_time: u64,
}

impl Serialize for FullSnapshot<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.snapshot;
        let mut map = serializer.serialize_map(Some(snapshot.entities.len() + 5))?;
        for (kind, records) in &snapshot.entities {
            map.serialize_entry(kind, records)?;
        }
        map.serialize_entry("wave", &snapshot.meta.wave)?;
        map.serialize_entry("walls", &snapshot.meta.walls)?;
        map.serialize_entry("arenaFlags", &snapshot.meta.arena_flags)?;
        map.serialize_entry("full", &true)?;
        map.serialize_entry("serverTime", &self.server_time)?;
        map.end()
    }
}

/// Changes since the previous emission
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffMessage {
    pub updated: BTreeMap<EntityKind, HashMap<EntityId, EntityRecord>>,
    pub removed: BTreeMap<EntityKind, Vec<EntityId>>,
    pub meta: ArenaMeta,
    pub server_time: u64,
}

impl DiffMessage {
    /// No entity was added, changed or removed
    pub fn has_no_entity_changes(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Sent to a single actor whose move was rejected
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementCorrection {
    pub x: f32,
    pub y: f32,
}

impl From<Vec2> for MovementCorrection {
    fn from(v: Vec2) -> Self {
        Self { x: v.x, y: v.y }
    }
}

/// Non-urgent notification, delivered through the per-viewer batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameEvent {
    #[serde(rename_all = "camelCase")]
    ActorJoined { actor_id: EntityId },
    #[serde(rename_all = "camelCase")]
    ActorLeft { actor_id: EntityId },
    #[serde(rename_all = "camelCase")]
    ActorDown { actor_id: EntityId },
    #[serde(rename_all = "camelCase")]
    HostileKilled { hostile_id: EntityId, by: Option<EntityRef> },
    #[serde(rename_all = "camelCase")]
    PickupCollected { pickup_id: EntityId, actor_id: EntityId, value: u32 },
    WaveStarted { wave: u32 },
}

/// `{ events: [...] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<GameEvent>,
}

/// `{ nonce, serverTime }`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub nonce: u64,
    pub server_time: u64,
}

/// First message on a new viewer's stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub actor_id: EntityId,
    pub tick_rate: u32,
}

/// Messages from server to viewer
#[derive(Debug, Clone)]
pub enum ServerMessage<'a> {
    Welcome(Welcome),
    Full(FullSnapshot<'a>),
    Diff(&'a DiffMessage),
    Correction(MovementCorrection),
    Batch(&'a EventBatch),
    Probe(Probe),
}

impl Serialize for ServerMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            return match self {
                ServerMessage::Welcome(m) => m.serialize(serializer),
                ServerMessage::Full(m) => m.serialize(serializer),
                ServerMessage::Diff(m) => m.serialize(serializer),
                ServerMessage::Correction(m) => m.serialize(serializer),
                ServerMessage::Batch(m) => m.serialize(serializer),
                ServerMessage::Probe(m) => m.serialize(serializer),
            };
        }

        const NAME: &str = "ServerMessage";
        match self {
            ServerMessage::Welcome(m) => serializer.serialize_newtype_variant(NAME, 0, "welcome", m),
            ServerMessage::Full(m) => serializer.serialize_newtype_variant(NAME, 1, "full", m),
            ServerMessage::Diff(m) => serializer.serialize_newtype_variant(NAME, 2, "diff", m),
            ServerMessage::Correction(m) => {
                serializer.serialize_newtype_variant(NAME, 3, "correction", m)
            }
            ServerMessage::Batch(m) => serializer.serialize_newtype_variant(NAME, 4, "batch", m),
            ServerMessage::Probe(m) => serializer.serialize_newtype_variant(NAME, 5, "probe", m),
        }
    }
}

// ============================================================================
// Encodings
// ============================================================================

/// Encoding used on a session's streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Binary,
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "text" => Ok(WireFormat::Json),
            "binary" | "bincode" => Ok(WireFormat::Binary),
            other => Err(format!("unknown wire format '{}'", other)),
        }
    }
}

impl WireFormat {
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            WireFormat::Json => encode_json(message),
            WireFormat::Binary => encode_binary(message),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        match self {
            WireFormat::Json => decode_json(data),
            WireFormat::Binary => decode_binary(data),
        }
    }
}

pub fn encode_json<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Compact binary encoding (bincode legacy config: fixed-width little endian)
pub fn encode_binary<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serde::encode_to_vec(message, bincode::config::legacy())?)
}

pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let (message, _) = bincode::serde::decode_from_slice(data, bincode::config::legacy())?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{Hostile, Wall};
    use serde_json::Value;

    fn snapshot() -> ReplicationSnapshot {
        let mut snapshot = ReplicationSnapshot::default();
        let mut hostiles = HashMap::new();
        hostiles.insert(4, EntityRecord::Hostile(Hostile::new(Vec2::new(10.0, 20.0), 30.0)));
        snapshot.entities.insert(EntityKind::Hostile, hostiles);
        snapshot.entities.insert(EntityKind::Actor, HashMap::new());
        snapshot.meta.wave = 3;
        snapshot.meta.walls.push(Wall::new(0.0, 0.0, 10.0, 100.0));
        snapshot
    }

    #[test]
    fn test_full_snapshot_json_shape() {
        let snapshot = snapshot();
        let full = FullSnapshot { snapshot: &snapshot, server_time: 1234 };
        let json: Value = serde_json::from_slice(&encode_json(&ServerMessage::Full(full)).unwrap()).unwrap();

        assert_eq!(json["full"], true);
        assert_eq!(json["serverTime"], 1234);
        assert_eq!(json["wave"], 3);
        assert_eq!(json["arenaFlags"]["bossSpawned"], false);
        assert_eq!(json["walls"][0]["height"], 100.0);
        assert_eq!(json["hostile"]["4"]["health"], 30.0);
        assert_eq!(json["hostile"]["4"]["maxHealth"], 30.0);
        assert!(json["actor"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_diff_json_shape() {
        let mut diff = DiffMessage::default();
        diff.removed.insert(EntityKind::Projectile, vec![7, 9]);
        diff.meta.wave = 2;
        diff.server_time = 99;

        let json: Value = serde_json::from_slice(&encode_json(&ServerMessage::Diff(&diff)).unwrap()).unwrap();
        assert_eq!(json["removed"]["projectile"], serde_json::json!([7, 9]));
        assert!(json["updated"].as_object().unwrap().is_empty());
        assert_eq!(json["meta"]["wave"], 2);
        assert_eq!(json["serverTime"], 99);
        assert!(json.get("full").is_none());
    }

    #[test]
    fn test_correction_and_probe_shapes() {
        let correction = ServerMessage::Correction(Vec2::new(1.5, -2.0).into());
        assert_eq!(
            serde_json::to_value(&correction).unwrap(),
            serde_json::json!({"x": 1.5, "y": -2.0})
        );

        let probe = ServerMessage::Probe(Probe { nonce: 5, server_time: 10 });
        assert_eq!(
            serde_json::to_value(&probe).unwrap(),
            serde_json::json!({"nonce": 5, "serverTime": 10})
        );
    }

    #[test]
    fn test_batch_shape() {
        let batch = EventBatch {
            events: vec![
                GameEvent::WaveStarted { wave: 2 },
                GameEvent::HostileKilled {
                    hostile_id: 3,
                    by: Some(EntityRef::new(EntityKind::Actor, 1)),
                },
            ],
        };
        let json = serde_json::to_value(&ServerMessage::Batch(&batch)).unwrap();
        assert_eq!(json["events"][0]["waveStarted"]["wave"], 2);
        assert_eq!(json["events"][1]["hostileKilled"]["hostileId"], 3);
        assert_eq!(json["events"][1]["hostileKilled"]["by"]["kind"], "actor");
    }

    #[test]
    fn test_client_message_both_encodings() {
        let message = ClientMessage::Move { x: 12.0, y: 34.0 };

        let json = encode_json(&message).unwrap();
        assert_eq!(std::str::from_utf8(&json).unwrap(), r#"{"move":{"x":12.0,"y":34.0}}"#);
        assert_eq!(decode_json::<ClientMessage>(&json).unwrap(), message);

        let binary = encode_binary(&message).unwrap();
        assert_eq!(decode_binary::<ClientMessage>(&binary).unwrap(), message);
        assert!(binary.len() < json.len());
    }

    #[test]
    fn test_binary_server_messages_are_tagged() {
        let a = encode_binary(&ServerMessage::Correction(MovementCorrection { x: 1.0, y: 2.0 })).unwrap();
        let b = encode_binary(&ServerMessage::Probe(Probe { nonce: 1, server_time: 2 })).unwrap();
        // legacy config writes the variant index as a little endian u32
        assert_eq!(&a[..4], &3u32.to_le_bytes());
        assert_eq!(&b[..4], &5u32.to_le_bytes());

        let snapshot = snapshot();
        let full = FullSnapshot { snapshot: &snapshot, server_time: 1 };
        let binary = encode_binary(&ServerMessage::Full(full)).unwrap();
        let json = encode_json(&ServerMessage::Full(full)).unwrap();
        assert!(binary.len() < json.len());
    }

    #[test]
    fn test_invalid_decode() {
        assert!(matches!(
            decode_json::<ClientMessage>(b"{\"teleport\":{}}"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decode_binary::<ClientMessage>(&[0xff, 0xff, 0xff, 0xff]),
            Err(ProtocolError::Decode(_))
        ));
        assert!(WireFormat::Json.decode::<ClientMessage>(b"not json").is_err());
    }
}
