// Library root: exposes the bot's modules so the binary and integration
// tests share one API.

pub mod app;
pub mod command;
pub mod config;
pub mod conversation;
pub mod gateway;
pub mod protocol;
