pub mod auth;
pub mod bus;
pub mod cache;
pub mod chat;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod observability;
pub mod presence;
pub mod push;
pub mod resilience;
pub mod signaling;
pub mod state;
pub mod storage;
