pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod history;
pub mod http;
pub mod inference;
pub mod proxy;
pub mod session;
pub mod types;
