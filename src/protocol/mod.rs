//! The wire protocol: frames are JSON arrays with their outer brackets stripped.
//!
//! Client operations are sent as
//!
//! ```ascii
//! <op code><counter>, payload field, payload field, ...
//! ```
//!
//! Server frames start with a tag `<sequence><task digit>` (0 ERROR, 1 CONNECT, 2 deliver,
//!  3 RESPONSE). A frame with fewer than two fields is a liveness frame carrying the server's
//!  count of sequenced frames sent to this client.

pub mod envelope;
pub mod filter_hash;
pub mod frame;
pub mod op_code;
