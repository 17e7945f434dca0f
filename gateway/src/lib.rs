pub mod api;
pub mod broadcast;
pub mod config;
pub mod message;
pub mod payload;
pub mod prometheus;
pub mod publisher;
pub mod router;
pub mod server;
pub mod upload;
