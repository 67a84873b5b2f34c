//! Infrastructure layer: stores, wire DTOs and message delivery.

pub mod dto;
pub mod message_pusher;
pub mod repository;
