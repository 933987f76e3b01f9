use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The kind of a client-initiated operation. The numeric value is part of the wire format: it
///  is the leading digit of every correlation id the client sends.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Connect = 1,
    Subscribe = 2,
    Publish = 3,
    EditFilter = 4,
    Unsubscribe = 5,
    Request = 6,
    SetDefaultConfig = 7,
    SetDisconnectEvent = 8,
    Retransmit = 9,
}

impl OpCode {
    /// The handshake is never registered as a pending operation - it is re-sent on every
    ///  transport open anyway.
    pub fn is_registered(self) -> bool {
        self != OpCode::Connect
    }
}

/// The kind of a server-originated frame, encoded as the last digit of the frame's tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TaskKind {
    Error = 0,
    Connect = 1,
    Deliver = 2,
    Response = 3,
}
