//! HTTP handlers of the sandbox repository server.

pub mod health_handlers;
pub mod sandbox_handlers;
