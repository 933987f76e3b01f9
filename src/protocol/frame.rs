use anyhow::bail;
use serde_json::{Map, Value};
use tracing::warn;

use crate::protocol::envelope::{FrameTag, OperationId};
use crate::protocol::filter_hash::FilterHash;
use crate::protocol::op_code::TaskKind;

/// A decoded frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Frames with fewer than two fields are liveness frames. The optional single field is the
    ///  number of sequenced frames the server sent to this client so far.
    Liveness { server_count: Option<u64> },
    Task(TaskFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskFrame {
    pub tag: FrameTag,
    pub message: ServerMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Error(ErrorData),
    Connect(ConnectData),
    Deliver(DeliverData),
    Response(ResponseData),
}

/// `[tag, operation, message, directive?, corrected value?]`
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorData {
    pub operation: Option<OperationId>,
    pub message: String,
    pub directive: ErrorDirective,
}

/// What the server wants the client to do in addition to discarding the failed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDirective {
    None,
    /// The server closes the session for good, the client must not reconnect
    Terminal,
    /// The server rejected the filter of a (different) pending operation and replaces it with
    ///  a canonical value
    Correction { target: OperationId, value: Value },
}

/// `[tag, client id, server id, secure id suffix]`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectData {
    pub client_id: String,
    pub server_id: String,
    pub secure_suffix: String,
}

/// `[tag, filter hash, payload, config?, target operation?]`
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverData {
    pub filter_hash: Option<FilterHash>,
    pub payload: Value,
    pub config: Value,
    pub target: Option<OperationId>,
}

impl DeliverData {
    /// Ordered deliveries are held back while an earlier sequence number is still missing
    pub fn is_ordered(&self) -> bool {
        self.config.get("ordered") == Some(&Value::Bool(true))
    }
}

/// `[tag, operation, payload]`
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseData {
    pub operation: Option<OperationId>,
    pub payload: Value,
}

impl InboundFrame {
    pub fn from_fields(fields: &[Value]) -> anyhow::Result<InboundFrame> {
        if fields.len() < 2 {
            let server_count = fields.first().and_then(Value::as_u64);
            return Ok(InboundFrame::Liveness { server_count });
        }

        let tag = FrameTag::from_wire(&fields[0])?;
        let message = match tag.task {
            TaskKind::Error => ServerMessage::Error(ErrorData {
                operation: OperationId::from_wire(&fields[1]),
                message: field(fields, 2).map(display_value).unwrap_or_default(),
                directive: match field(fields, 3) {
                    Some(Value::Bool(true)) => ErrorDirective::Terminal,
                    Some(target) => match OperationId::from_wire(target) {
                        Some(target) => ErrorDirective::Correction {
                            target,
                            value: field(fields, 4).cloned().unwrap_or(Value::Null),
                        },
                        None => ErrorDirective::None,
                    },
                    None => ErrorDirective::None,
                },
            }),
            TaskKind::Connect => {
                let client_id = match field(fields, 1) {
                    Some(id) => display_value(id),
                    None => bail!("CONNECT frame without a client id"),
                };
                ServerMessage::Connect(ConnectData {
                    client_id,
                    server_id: field(fields, 2).map(display_value).unwrap_or_default(),
                    secure_suffix: field(fields, 3).map(display_value).unwrap_or_default(),
                })
            }
            TaskKind::Deliver => ServerMessage::Deliver(DeliverData {
                filter_hash: FilterHash::from_wire(&fields[1]),
                payload: field(fields, 2).cloned().unwrap_or(Value::Null),
                config: field(fields, 3).cloned().unwrap_or_else(|| Value::Object(Map::new())),
                target: field(fields, 4).and_then(OperationId::from_wire),
            }),
            TaskKind::Response => ServerMessage::Response(ResponseData {
                operation: OperationId::from_wire(&fields[1]),
                payload: field(fields, 2).cloned().unwrap_or(Value::Null),
            }),
        };

        Ok(InboundFrame::Task(TaskFrame { tag, message }))
    }
}

/// a field that is absent or explicitly `null`
fn field(fields: &[Value], idx: usize) -> Option<&Value> {
    fields.get(idx).filter(|v| !v.is_null())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses the payload of a retransmission response: a list of `[sequence number, frame fields]`
///  pairs. Malformed entries are skipped.
pub fn retransmitted_frames(payload: &Value) -> Vec<(u64, Vec<Value>)> {
    let Some(entries) = payload.as_array() else {
        warn!("retransmission response is not a list - ignoring");
        return Vec::new();
    };

    entries.iter()
        .filter_map(|entry| {
            let sequence = entry.get(0).and_then(|s| s.as_u64().or_else(|| s.as_str()?.parse().ok()));
            let fields = entry.get(1).and_then(Value::as_array);
            match (sequence, fields) {
                (Some(sequence), Some(fields)) => Some((sequence, fields.clone())),
                _ => {
                    warn!("malformed retransmission entry {} - skipping", entry);
                    None
                }
            }
        })
        .collect()
}
