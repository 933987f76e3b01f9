use std::fmt::{Debug, Formatter};

use serde_json::Value;

/// The content identity of a subscription filter. Server and client compute it the same way, so
///  deliveries can be tagged with the hash instead of the full filter.
///
/// The hash is a wrapping 32-bit `h = h * 31 + c` over the UTF-16 code units of the filter's
///  string form. Strings are hashed verbatim. Objects, arrays and null are hashed over their
///  compact JSON serialization. Numbers and booleans have no string form for the server's
///  hash, so they all hash to 0.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FilterHash(pub i32);

impl FilterHash {
    pub fn of(filter: &Value) -> FilterHash {
        match filter {
            Value::String(s) => Self::of_str(s),
            Value::Number(_) | Value::Bool(_) => FilterHash(0),
            other => Self::of_str(&other.to_string()),
        }
    }

    pub fn of_str(text: &str) -> FilterHash {
        let hash = text.encode_utf16()
            .fold(0i32, |hash, c| hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(c as i32));
        FilterHash(hash)
    }

    /// Reads a hash as it appears in an inbound frame. Values that are not integral numbers
    ///  do not identify any filter.
    pub fn from_wire(value: &Value) -> Option<FilterHash> {
        value.as_i64()
            .and_then(|raw| i32::try_from(raw).ok())
            .map(FilterHash)
    }

    pub fn to_wire(self) -> Value {
        Value::from(self.0)
    }
}

impl Debug for FilterHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
