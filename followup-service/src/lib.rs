pub mod components;
pub mod config;
pub mod error;
pub mod handlers;
pub mod prompt;
pub mod server;
