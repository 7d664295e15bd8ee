//! Mutation records and their wire format.
//!
//! A record travels as `{ "v", "entity", "action", "data", "by", "ts" }`.
//! Records without `v` were written before the tag existed and read as
//! version 1.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Highest wire version this crate reads, and the one it writes.
pub const WIRE_VERSION: u32 = 1;

/// Record kind a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Author,
    Book,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Author => "author",
            Entity::Book => "book",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author" => Ok(Entity::Author),
            "book" => Ok(Entity::Book),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Operation a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Update and delete address an existing record by id.
    pub fn requires_target(&self) -> bool {
        matches!(self, Action::Update | Action::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

/// Raised when a record is built from invalid parts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{action} of {entity} requires an `_id` in data")]
    MissingTarget { entity: Entity, action: Action },
}

/// Raised when a queued payload cannot be turned back into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported mutation {action} on {entity}")]
    UnsupportedMutation { entity: String, action: String },
}

/// One create/update/delete operation awaiting application.
///
/// Immutable once built: there are getters but no setters.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    entity: Entity,
    action: Action,
    data: Value,
    submitted_by: String,
    submitted_at: i64,
}

impl MutationRecord {
    /// Build a record stamped with the current time.
    pub fn new(
        entity: Entity,
        action: Action,
        data: Value,
        submitted_by: impl Into<String>,
    ) -> Result<Self, RecordError> {
        Self::with_timestamp(
            entity,
            action,
            data,
            submitted_by,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    /// Build a record with an explicit `submitted_at` (milliseconds since epoch).
    pub fn with_timestamp(
        entity: Entity,
        action: Action,
        data: Value,
        submitted_by: impl Into<String>,
        submitted_at: i64,
    ) -> Result<Self, RecordError> {
        if action.requires_target() && target_id(&data).is_none() {
            return Err(RecordError::MissingTarget { entity, action });
        }

        Ok(Self {
            entity,
            action,
            data,
            submitted_by: submitted_by.into(),
            submitted_at,
        })
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn submitted_by(&self) -> &str {
        &self.submitted_by
    }

    pub fn submitted_at(&self) -> i64 {
        self.submitted_at
    }

    /// Identifier of the record the mutation addresses, if `data` carries one.
    pub fn target_id(&self) -> Option<&str> {
        target_id(&self.data)
    }

    /// Serialize into the current wire version.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WireRecordOut {
            v: WIRE_VERSION,
            entity: self.entity,
            action: self.action,
            data: &self.data,
            by: &self.submitted_by,
            ts: self.submitted_at,
        })
    }

    /// Parse a wire payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireRecordIn =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let version = wire.v.unwrap_or(1);
        if version == 0 || version > WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        if wire.entity.is_empty() || wire.action.is_empty() {
            return Err(DecodeError::Malformed(
                "entity and action are required".to_string(),
            ));
        }

        let (entity, action) = match (wire.entity.parse::<Entity>(), wire.action.parse::<Action>()) {
            (Ok(entity), Ok(action)) => (entity, action),
            _ => {
                return Err(DecodeError::UnsupportedMutation {
                    entity: wire.entity,
                    action: wire.action,
                })
            }
        };

        Self::with_timestamp(entity, action, wire.data, wire.by, wire.ts)
            .map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

/// `_id` (or `id`) of a payload, when it is a non-empty string.
pub fn target_id(data: &Value) -> Option<&str> {
    ["_id", "id"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_str))
        .find(|id| !id.is_empty())
}

#[derive(Serialize)]
struct WireRecordOut<'a> {
    v: u32,
    entity: Entity,
    action: Action,
    data: &'a Value,
    by: &'a str,
    ts: i64,
}

#[derive(Deserialize)]
struct WireRecordIn {
    #[serde(default)]
    v: Option<u32>,
    entity: String,
    action: String,
    #[serde(default)]
    data: Value,
    by: String,
    ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_writes_version_tag_and_short_keys() {
        let record = MutationRecord::with_timestamp(
            Entity::Author,
            Action::Create,
            json!({"name": "Ada"}),
            "ada",
            1_700_000_000_000,
        )
        .unwrap();

        let wire: Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({
                "v": 1,
                "entity": "author",
                "action": "create",
                "data": {"name": "Ada"},
                "by": "ada",
                "ts": 1_700_000_000_000i64
            })
        );
    }

    #[test]
    fn legacy_record_without_version_decodes() {
        let payload = br#"{"entity":"book","action":"delete","data":{"_id":"b1"},"by":"ada","ts":5}"#;
        let record = MutationRecord::decode(payload).unwrap();
        assert_eq!(record.entity(), Entity::Book);
        assert_eq!(record.action(), Action::Delete);
        assert_eq!(record.target_id(), Some("b1"));
        assert_eq!(record.submitted_by(), "ada");
        assert_eq!(record.submitted_at(), 5);
    }

    #[test]
    fn future_version_is_rejected() {
        let payload = br#"{"v":2,"entity":"book","action":"create","data":{},"by":"ada","ts":5}"#;
        assert_eq!(
            MutationRecord::decode(payload),
            Err(DecodeError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn unknown_pair_is_unsupported_not_malformed() {
        let payload = br#"{"v":1,"entity":"publisher","action":"create","data":{},"by":"ada","ts":5}"#;
        assert_eq!(
            MutationRecord::decode(payload),
            Err(DecodeError::UnsupportedMutation {
                entity: "publisher".to_string(),
                action: "create".to_string(),
            })
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            MutationRecord::decode(b"not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            MutationRecord::decode(br#"{"entity":"author","action":"create"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn update_without_id_is_refused_on_both_sides() {
        let err = MutationRecord::new(Entity::Author, Action::Update, json!({"name": "x"}), "ada")
            .unwrap_err();
        assert_eq!(
            err,
            RecordError::MissingTarget {
                entity: Entity::Author,
                action: Action::Update
            }
        );

        let payload = br#"{"v":1,"entity":"author","action":"update","data":{"_id":""},"by":"ada","ts":5}"#;
        assert!(matches!(
            MutationRecord::decode(payload),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn id_alias_is_accepted() {
        assert_eq!(target_id(&json!({"id": "a1"})), Some("a1"));
        assert_eq!(target_id(&json!({"_id": "a2", "id": "a1"})), Some("a2"));
        assert_eq!(target_id(&json!({"_id": 42})), None);
    }
}
