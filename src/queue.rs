//! Redis Streams task queue integration.
//!
//! One stream carries every pending task message; worker processes share a
//! consumer group so the queue service arbitrates work distribution. Delivery
//! is at-least-once: a message stays in a consumer's pending list until the
//! worker acknowledges it after the full pipeline run, and a restarted worker
//! re-reads its own pending entries before claiming new work.

use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while talking to the queue service.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis command or connection failure.
    #[error("Queue request failed: {0}")]
    Redis(#[from] redis::RedisError),
    /// Stream entry did not carry a decodable task message.
    #[error("Malformed queue message: {0}")]
    MalformedMessage(String),
}

/// Message published per task; the payload the queue round-trips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMessage {
    /// Task identifier assigned by the partitioner.
    pub id: String,
    /// Optional task flavor; `"raptor"` routes to the summarization stage.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
}

impl TaskMessage {
    /// Build a plain chunk-and-embed task message.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
        }
    }

    /// Whether this message routes the task to the RAPTOR stage.
    pub fn is_raptor(&self) -> bool {
        self.kind.as_deref() == Some("raptor")
    }
}

/// A claimed stream entry awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stream entry id used for acknowledgment.
    pub stream_id: String,
    /// Decoded task message.
    pub message: TaskMessage,
}

/// Redis Streams client scoped to one stream and consumer group.
#[derive(Clone)]
pub struct TaskQueue {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
}

impl TaskQueue {
    /// Connect to Redis and ensure the stream plus consumer group exist.
    pub async fn connect(url: &str, stream: &str, group: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        // MKSTREAM creates the stream on first boot; BUSYGROUP means another
        // worker already created the group.
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(error) = created {
            if !error.to_string().contains("BUSYGROUP") {
                return Err(error.into());
            }
        }
        tracing::debug!(stream, group, "Task queue ready");

        Ok(Self {
            conn,
            stream: stream.to_string(),
            group: group.to_string(),
        })
    }

    /// Publish one task message onto the stream.
    pub async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)
            .map_err(|error| QueueError::MalformedMessage(error.to_string()))?;
        let mut conn = self.conn.clone();
        let _id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("message")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Re-read this consumer's oldest pending entry, if any.
    ///
    /// This is the crash-recovery path: an entry delivered to this consumer
    /// before a crash is still unacknowledged and must be retried before new
    /// work is drawn.
    pub async fn recover_unacked(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        self.read_group(consumer, "0", 0).await
    }

    /// Claim the next new message for this consumer, blocking briefly.
    pub async fn claim_new(
        &self,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Option<Delivery>, QueueError> {
        self.read_group(consumer, ">", block_ms).await
    }

    /// Acknowledge a fully handled stream entry.
    pub async fn ack(&self, stream_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _count: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(stream_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Store a liveness record under `key` with a bounded time-to-live.
    pub async fn publish_liveness(
        &self,
        key: &str,
        payload: &str,
        ttl_secs: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_group(
        &self,
        consumer: &str,
        id: &str,
        block_ms: u64,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(id);
        let reply: redis::Value = cmd.query_async(&mut conn).await?;
        for (stream_id, message) in parse_stream_reply(reply)? {
            match message {
                Some(message) => return Ok(Some(Delivery { stream_id, message })),
                None => {
                    // A poisoned entry would be redelivered forever; drop it.
                    tracing::warn!(stream_id = %stream_id, "Dropping undecodable queue entry");
                    self.ack(&stream_id).await?;
                }
            }
        }
        Ok(None)
    }
}

/// Decode an XREADGROUP reply into `(entry id, message)` pairs.
///
/// Reply shape: `[[stream, [[entry_id, [field, value, ...]], ...]]]`. An
/// entry without a decodable `message` field yields `None` so the caller can
/// acknowledge and drop it instead of spinning on redelivery.
fn parse_stream_reply(
    reply: redis::Value,
) -> Result<Vec<(String, Option<TaskMessage>)>, QueueError> {
    let mut entries_out = Vec::new();
    let streams = match reply {
        redis::Value::Array(streams) => streams,
        redis::Value::Nil => return Ok(entries_out),
        other => {
            return Err(QueueError::MalformedMessage(format!(
                "unexpected XREADGROUP reply: {other:?}"
            )));
        }
    };

    for stream in streams {
        let redis::Value::Array(stream_parts) = stream else {
            continue;
        };
        let Some(redis::Value::Array(entries)) = stream_parts.into_iter().nth(1) else {
            continue;
        };
        for entry in entries {
            let redis::Value::Array(entry_parts) = entry else {
                continue;
            };
            let mut parts = entry_parts.into_iter();
            let Some(redis::Value::BulkString(raw_id)) = parts.next() else {
                continue;
            };
            let stream_id = String::from_utf8_lossy(&raw_id).to_string();
            let Some(redis::Value::Array(fields)) = parts.next() else {
                continue;
            };
            let message = decode_message_field(&stream_id, fields);
            entries_out.push((stream_id, message));
        }
    }

    Ok(entries_out)
}

fn decode_message_field(stream_id: &str, fields: Vec<redis::Value>) -> Option<TaskMessage> {
    let mut iter = fields.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        let (redis::Value::BulkString(key), redis::Value::BulkString(value)) = (key, value) else {
            continue;
        };
        if key != b"message" {
            continue;
        }
        return match serde_json::from_slice::<TaskMessage>(&value) {
            Ok(message) => Some(message),
            Err(error) => {
                tracing::warn!(stream_id = %stream_id, error = %error, "Malformed task message");
                None
            }
        };
    }
    None
}
