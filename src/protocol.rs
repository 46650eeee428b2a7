//! Wire Protocol
//!
//! Commands travel from writers and readers to every replica; replies travel
//! from one replica back to the reader that asked. Both are flat JSON objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

/// Name of the fan-out exchange every replica queue is bound to
pub const COMMAND_EXCHANGE: &str = "replication";

/// Name of the direct exchange replies are routed through
pub const RESPONSE_EXCHANGE: &str = "response";

/// Prefix of a replica's durable queue name
pub const REPLICA_QUEUE_PREFIX: &str = "replica_";

/// Content type attached to every published body
pub const CONTENT_TYPE: &str = "application/json";

/// Durable queue name for a replica identity
pub fn replica_queue_name(replica_id: &str) -> String {
    format!("{}{}", REPLICA_QUEUE_PREFIX, replica_id)
}

/// Identifier of a command, unique while the command is in flight
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// View as the routing key used on the response exchange
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A statement broadcast to all replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub query: String,
    /// Originator label; older writers omit it
    #[serde(default)]
    pub source: String,
    pub is_read: bool,
}

impl Command {
    /// Build a write command with a fresh id
    pub fn write(query: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: CommandId::generate(),
            query: query.into(),
            source: source.into(),
            is_read: false,
        }
    }

    /// Build a read command under an id the caller already reserved
    pub fn read(id: CommandId, query: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id,
            query: query.into(),
            source: source.into(),
            is_read: true,
        }
    }

    /// Serialize to the JSON wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from the JSON wire form
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short form of the statement for log lines
    pub fn preview(&self) -> &str {
        preview(&self.query)
    }
}

/// A read result routed back to one reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub request_id: CommandId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Vec<Record>,
}

impl Reply {
    pub fn new(request_id: CommandId, data: Vec<Record>) -> Self {
        Self { request_id, data }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One row of the replicated table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{} {} {} {}}}",
            self.id,
            self.key,
            self.value,
            self.created_at.to_rfc3339()
        )
    }
}

/// Empty result sets have been serialized as `null` by some replicas
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Record>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Record>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Shorten a statement for log lines
pub(crate) fn preview(sql: &str) -> &str {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record(id: i64) -> Record {
        Record {
            id,
            key: format!("k{}", id),
            value: format!("v{}", id),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_command_wire_fields() {
        let cmd = Command {
            id: "w1".into(),
            query: "INSERT INTO t VALUES (1)".into(),
            source: String::new(),
            is_read: false,
        };

        let value: serde_json::Value = serde_json::from_slice(&cmd.encode().unwrap()).unwrap();
        assert_eq!(value["id"], "w1");
        assert_eq!(value["query"], "INSERT INTO t VALUES (1)");
        assert_eq!(value["source"], "");
        assert_eq!(value["is_read"], false);

        assert_eq!(Command::decode(&cmd.encode().unwrap()).unwrap(), cmd);
    }

    #[test]
    fn test_command_without_source() {
        let cmd = Command::decode(br#"{"id":"w2","query":"DELETE FROM t","is_read":false}"#).unwrap();
        assert_eq!(cmd.id.as_str(), "w2");
        assert!(cmd.source.is_empty());
        assert!(!cmd.is_read);
    }

    #[test]
    fn test_malformed_command() {
        assert!(Command::decode(b"not json").is_err());
        assert!(Command::decode(br#"{"id":"x","query":"SELECT 1"}"#).is_err());
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = Reply::new("r1".into(), vec![sample_record(1), sample_record(2)]);
        let bytes = reply.encode().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["request_id"], "r1");
        assert_eq!(value["data"][1]["key"], "k2");
        assert_eq!(value["data"][0]["created_at"], "2024-03-01T12:00:00Z");

        assert_eq!(Reply::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_reply_null_data() {
        let reply = Reply::decode(br#"{"request_id":"r9","data":null}"#).unwrap();
        assert_eq!(reply.request_id.as_str(), "r9");
        assert!(reply.data.is_empty());

        let reply = Reply::decode(br#"{"request_id":"r9"}"#).unwrap();
        assert!(reply.data.is_empty());
    }

    #[test]
    fn test_reply_nanosecond_timestamp() {
        let reply = Reply::decode(
            br#"{"request_id":"r3","data":[{"id":7,"key":"a","value":"b","created_at":"2024-05-06T07:08:09.123456789+02:00"}]}"#,
        )
        .unwrap();
        assert_eq!(reply.data[0].id, 7);
        assert_eq!(reply.data[0].created_at.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| CommandId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_replica_queue_name() {
        assert_eq!(replica_queue_name("replica1"), "replica_replica1");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let long = "é".repeat(150);
        assert_eq!(preview(&long).chars().count(), 100);
        assert_eq!(preview("SELECT 1"), "SELECT 1");
    }
}
