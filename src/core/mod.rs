pub mod config;
pub mod context;
pub mod controller;
pub mod events;
pub mod library;
pub mod message;
pub mod persistence;
pub mod provider;
pub mod session;
pub mod store;
pub mod tokens;
