//! Chat relay — forwards new chat-channel items to a notification sink,
//! at least once, without re-sending what was already delivered.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
