pub mod domain;
pub mod event;
pub mod health;
pub mod message;
pub mod retry;
