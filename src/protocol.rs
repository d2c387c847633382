//! JSON-RPC envelope types and the `Content-Length` framing used on the LSP
//! stdio stream.
//!
//! The broker never interprets LSP payloads; everything below the envelope
//! (id, method, result, error) is carried as opaque `serde_json::Value`.

use crate::error::BrokerError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// Upper bound for a single framed body. Generously above the largest
/// workspace/diagnostic payloads observed in practice.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

// JSON-RPC error codes surfaced on the client API.
pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC request id: integer, string, or explicit null.
///
/// The wire shape is preserved on round-trip. An absent id (notification) is
/// represented as `None` at the envelope level, distinct from `Null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl RequestId {
    pub fn from_value(value: &Value) -> Option<RequestId> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            Value::Null => Some(RequestId::Null),
            _ => None,
        }
    }

    /// Numeric view for the internal pending map. String ids that parse as
    /// decimal integers are accepted as aliases of the number form.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(s) => s.parse().ok(),
            RequestId::Null => None,
        }
    }

    /// Distinguishes a null id from a notification without an id field.
    pub fn is_set(&self) -> bool {
        !matches!(self, RequestId::Null)
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::String(s) => Value::from(s.clone()),
            RequestId::Null => Value::Null,
        }
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestId::Number(n) => serializer.serialize_i64(*n),
            RequestId::String(s) => serializer.serialize_str(s),
            RequestId::Null => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = RequestId;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a string, an integer, or null")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<RequestId, E> {
                Ok(RequestId::Number(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<RequestId, E> {
                i64::try_from(v)
                    .map(RequestId::Number)
                    .map_err(|_| E::custom("request id out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<RequestId, E> {
                Ok(RequestId::String(v.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<RequestId, E> {
                Ok(RequestId::Null)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// Read one framed message: header lines terminated by a blank line, then a
/// body of exactly `Content-Length` bytes. Headers other than
/// `Content-Length` are tolerated and skipped.
pub async fn read_message<R>(reader: &mut R) -> Result<Value, BrokerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(BrokerError::ChannelClosed);
        }

        let line = line.trim_end();
        if line.is_empty() {
            break;
        }

        if let Some(rest) = line.strip_prefix("Content-Length:") {
            let len: usize = rest
                .trim()
                .parse()
                .map_err(|_| BrokerError::Protocol(format!("invalid Content-Length: {line}")))?;
            if len > MAX_MESSAGE_SIZE {
                return Err(BrokerError::Protocol(format!(
                    "message of {len} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit"
                )));
            }
            content_length = Some(len);
        }
    }

    let len = match content_length {
        Some(len) if len > 0 => len,
        _ => return Err(BrokerError::Protocol("missing Content-Length header".into())),
    };

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    serde_json::from_slice(&body)
        .map_err(|e| BrokerError::Protocol(format!("malformed message body: {e}")))
}

/// Write one framed message. The header and body go out in a single buffered
/// write; the caller serializes concurrent writers with a mutex.
pub async fn write_message<W>(writer: &mut W, msg: &Value) -> Result<(), BrokerError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg)
        .map_err(|e| BrokerError::Protocol(format!("unserializable message: {e}")))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(BrokerError::Protocol(format!(
            "message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(body.len() + 32);
    frame.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
