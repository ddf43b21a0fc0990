//! Zonelimit - Leaky-Bucket Rate Limiting Service
//!
//! This crate limits request rates per key within shared named zones. Each
//! zone keeps a bounded table of leaky-bucket records keyed by request
//! attributes, evicts idle records, and can escalate repeat offenders to a
//! hard block. The limiter is exposed to proxies through an HTTP/JSON sidecar.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
