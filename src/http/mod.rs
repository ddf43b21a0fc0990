//! HTTP/JSON sidecar surface for the rate limiter.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{AttributesRequest, RespBody, ZonelimitService, MAX_BODY_BYTES};
