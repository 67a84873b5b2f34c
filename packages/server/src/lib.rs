//! Multi-room line-oriented chat server.
//!
//! Clients connect over TCP and speak a whitespace-tokenized text protocol.
//! A manager actor owns accounts and the room directory, one actor per room
//! owns its connected members, and every connection runs as a session with
//! separate reader and writer tasks.

// layers
pub mod domain;
pub mod infrastructure;
pub mod ui;
pub mod usecase;

pub mod config;
