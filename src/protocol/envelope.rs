use std::fmt::{Debug, Display, Formatter};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use serde_json::Value;

use crate::protocol::op_code::{OpCode, TaskKind};
use crate::transport::WireFrame;

/// Correlation id of a client-initiated operation. On the wire it is rendered as the decimal
///  concatenation `<op code><counter>`; the op code is always a single digit, so the two parts
///  can be recovered unambiguously.
///
/// Ids are ordered by counter, i.e. in the order they were created.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OperationId {
    pub counter: u64,
    pub op_code: OpCode,
}

impl OperationId {
    pub fn new(op_code: OpCode, counter: u64) -> OperationId {
        OperationId { counter, op_code }
    }

    pub fn to_wire(self) -> Value {
        let digits = self.counter.checked_ilog10().map_or(1, |d| d + 1);
        10u64.checked_pow(digits)
            .and_then(|factor| u64::from(u8::from(self.op_code)).checked_mul(factor))
            .and_then(|prefix| prefix.checked_add(self.counter))
            .map(Value::from)
            .unwrap_or_else(|| Value::String(self.to_string()))
    }

    pub fn from_wire(value: &Value) -> Option<OperationId> {
        let raw = wire_digits(value)?;
        let mut chars = raw.chars();
        let op_code = chars.next()?
            .to_digit(10)
            .and_then(|d| OpCode::try_from(d as u8).ok())?;
        let counter = chars.as_str().parse::<u64>().ok()?;
        Some(OperationId { counter, op_code })
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", u8::from(self.op_code), self.counter)
    }
}

impl Debug for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?}#{})", self, self.op_code, self.counter)
    }
}

/// The tag in front of every server-originated task frame: `<sequence><task digit>`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameTag {
    pub sequence: u64,
    pub task: TaskKind,
}

impl FrameTag {
    pub fn from_wire(value: &Value) -> anyhow::Result<FrameTag> {
        let raw = wire_digits(value)
            .ok_or_else(|| anyhow!("frame tag is neither a number nor a string: {}", value))?;

        let (sequence, task) = match raw.char_indices().last() {
            Some((idx, last)) => (&raw[..idx], last),
            None => bail!("empty frame tag"),
        };

        let task = last_digit(task)
            .and_then(|d| TaskKind::try_from(d).ok())
            .ok_or_else(|| anyhow!("frame tag {} has an unknown task discriminator", raw))?;

        // a tag consisting of the task digit only carries no sequence information
        let sequence = if sequence.is_empty() {
            0
        }
        else {
            sequence.parse::<u64>()
                .map_err(|e| anyhow!("frame tag {} has an invalid sequence number: {}", raw, e))?
        };

        Ok(FrameTag { sequence, task })
    }
}

fn last_digit(c: char) -> Option<u8> {
    c.to_digit(10).map(|d| d as u8)
}

fn wire_digits(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Encodes an operation as `[id, payload...]` with the outer brackets stripped, so frames can be
///  wrapped uniformly by the receiving side.
pub fn encode_operation(id: OperationId, payload: &[Value], binary: bool) -> anyhow::Result<WireFrame> {
    let mut fields = Vec::with_capacity(payload.len() + 1);
    fields.push(id.to_wire());
    fields.extend_from_slice(payload);

    let text = serde_json::to_string(&Value::Array(fields))?;
    // a serialized array always starts with '[' and ends with ']'
    let text = text[1..text.len() - 1].to_string();

    if binary {
        Ok(WireFrame::Binary(Bytes::from(text.into_bytes())))
    }
    else {
        Ok(WireFrame::Text(text))
    }
}

/// Decodes the raw content of a frame into its list of fields.
pub fn decode_fields(frame: &WireFrame) -> anyhow::Result<Vec<Value>> {
    let text = match frame {
        WireFrame::Text(text) => text.as_str(),
        WireFrame::Binary(bytes) => std::str::from_utf8(bytes)?,
    };

    let fields: Vec<Value> = serde_json::from_str(&format!("[{}]", text))?;
    Ok(fields)
}
