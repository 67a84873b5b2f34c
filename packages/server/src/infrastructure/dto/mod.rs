//! Data Transfer Objects for the chat server.
//!
//! - `wire`: line protocol commands and outbound messages

pub mod wire;
