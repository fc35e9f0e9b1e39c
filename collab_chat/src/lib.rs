//! Conversation storage, HTTP API and realtime gateway for the
//! collaboration chat service.

pub mod api;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod db;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod hub;
pub mod messages;
pub mod profiles;
pub mod reads;
pub mod typing;
