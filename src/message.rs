//! Message entity and its state machine.
//!
//! A [`Message`] is the unit of work: an opaque string payload published to a
//! topic, optionally partitioned into a named queue, and carried through the
//! lifecycle `Waiting -> Processing -> {Success | Waiting (retry) | Failed}`.
//! Success and Failed are terminal; Processing can fall back to Waiting when
//! a worker is cancelled mid-consume or a reaper recovers a stuck row.

use std::{borrow::Cow, collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MqError, Result};

type SqliteDb = sqlx::Sqlite;
type SqliteTypeInfo = sqlx::sqlite::SqliteTypeInfo;
type SqliteValueRef<'r> = sqlx::sqlite::SqliteValueRef<'r>;
type SqliteArgumentValue<'q> = sqlx::sqlite::SqliteArgumentValue<'q>;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed message identifier.
///
/// Wraps a UUID assigned once at publish time; it never changes for the
/// lifetime of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<SqliteDb> for MessageId {
    fn type_info() -> SqliteTypeInfo {
        <&str as sqlx::Type<SqliteDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, SqliteDb> for MessageId {
    fn decode(value: SqliteValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<SqliteDb>>::decode(value)?;
        Ok(Self(Uuid::parse_str(raw)?))
    }
}

impl<'q> sqlx::Encode<'q, SqliteDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut Vec<SqliteArgumentValue<'q>>) -> EncodeResult {
        buf.push(SqliteArgumentValue::Text(Cow::Owned(self.0.to_string())));
        Ok(sqlx::encode::IsNull::No)
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Eligible to be claimed once `executable_time` has passed.
    ///
    /// The initial state, and the state a message returns to on retry or
    /// recovery.
    Waiting,

    /// Claimed by exactly one worker which is currently consuming it.
    Processing,

    /// Consumed successfully. Terminal.
    Success,

    /// Retries exhausted. Terminal; requires operator action or a fresh
    /// publish to process again.
    Failed,
}

impl MessageStatus {
    /// Returns `true` for the terminal states Success and Failed.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Processing => write!(f, "processing"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(MqError::storage(format!("invalid message status: {other}"))),
        }
    }
}

impl sqlx::Type<SqliteDb> for MessageStatus {
    fn type_info() -> SqliteTypeInfo {
        <&str as sqlx::Type<SqliteDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, SqliteDb> for MessageStatus {
    fn decode(value: SqliteValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<SqliteDb>>::decode(value)?;
        raw.parse().map_err(|e: MqError| e.to_string().into())
    }
}

impl<'q> sqlx::Encode<'q, SqliteDb> for MessageStatus {
    fn encode_by_ref(&self, buf: &mut Vec<SqliteArgumentValue<'q>>) -> EncodeResult {
        buf.push(SqliteArgumentValue::Text(Cow::Owned(self.to_string())));
        Ok(sqlx::encode::IsNull::No)
    }
}

/// Durable unit of work.
///
/// Mutated only by the poll worker (claim, ack, nack, retry) and the reapers
/// (timeout reset, purge); consumers receive the payload, never the row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Unique identifier, assigned at publish time.
    pub id: MessageId,

    /// Logical channel this message belongs to.
    pub topic: String,

    /// Optional sub-partition within the topic, used for claim fairness.
    pub queue: Option<String>,

    /// Opaque payload; consumers deserialize it themselves.
    pub data: String,

    /// Optional JSON-encoded `String -> String` map for context propagation.
    pub header: Option<String>,

    /// Current lifecycle state.
    pub status: MessageStatus,

    /// When the message was published. Never mutated; drives retention purge.
    pub create_time: DateTime<Utc>,

    /// Earliest time the message is eligible to be claimed.
    ///
    /// Initially `create_time` plus any publish delay; stamped to the claim
    /// time on claim and advanced on each retry.
    pub executable_time: DateTime<Utc>,

    /// Number of retry attempts already consumed. Only ever increases.
    pub retry_count: u32,
}

impl Message {
    /// Creates a Waiting message eligible for immediate claim.
    pub fn new(topic: impl Into<String>, data: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            topic: topic.into(),
            queue: None,
            data: data.into(),
            header: None,
            status: MessageStatus::Waiting,
            create_time: now,
            executable_time: now,
            retry_count: 0,
        }
    }

    /// Replaces the header map, JSON-encoding it into the `header` field.
    pub fn set_header(&mut self, header: &HashMap<String, String>) -> Result<()> {
        self.header = Some(
            serde_json::to_string(header)
                .map_err(|e| MqError::storage(format!("failed to encode header: {e}")))?,
        );
        Ok(())
    }

    /// Adds a single header entry, preserving any existing entries.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let mut header = self.get_header()?.unwrap_or_default();
        header.insert(key.into(), value.into());
        self.set_header(&header)
    }

    /// Decodes the header map, or `None` if no header was set.
    pub fn get_header(&self) -> Result<Option<HashMap<String, String>>> {
        match &self.header {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| MqError::storage(format!("failed to decode header: {e}"))),
        }
    }
}
