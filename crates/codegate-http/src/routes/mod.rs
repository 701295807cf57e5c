//! HTTP API route handlers.

pub mod ai;
pub mod convert;
pub mod quota;
pub mod system;
