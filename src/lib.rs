//! Client side of a reliable publish/subscribe session over an unreliable message transport.
//!
//! The [session::client::Client] keeps a session alive across reconnects: pending operations
//!  and subscriptions are re-sent after every reconnect, and sequence gaps in the server's
//!  deliveries are detected and filled by requesting retransmission.

pub mod protocol;
pub mod session;
pub mod transport;
pub mod test_util;
