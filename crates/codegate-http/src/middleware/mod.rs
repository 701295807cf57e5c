//! HTTP middleware: request ID tracking and principal resolution.

pub mod principal;
pub mod request_id;
