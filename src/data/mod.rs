pub mod auth;
pub mod cache;
pub mod http;
pub mod kalshi_api;
pub mod news;
pub mod types;
