//! HTTP request handlers.

pub mod call;
pub mod health;
