pub mod api;
pub mod clients;
pub mod config;
pub mod consumer;
pub mod error;
pub mod materializer;
pub mod models;
pub mod producer;
pub mod store;
pub mod utils;
