pub mod client;
pub mod connection;
pub mod operation_registry;
pub mod request_error;
pub mod sequence_tracker;
pub mod session_config;
pub mod session_events;
pub mod session_state;
pub mod subscription_registry;
