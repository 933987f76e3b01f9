//! Utilities for testing code that uses a session: an in-memory transport that is controlled
//!  by test code. They are used for testing the session itself, and they are exported for
//!  application testing.

pub mod transport;
