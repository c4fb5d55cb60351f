//! HTTP surface for triggering reminder runs and reading their status.

pub mod http;

pub use http::{HttpState, create_router};
