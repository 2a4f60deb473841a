//! Ratewarden - Shared Fixed-Window Admission Control
//!
//! This crate throttles callers across many independent server processes.
//! Each process counts requests in a shared Redis-compatible store using
//! atomic increments on per-window keys, so no coordination between the
//! processes themselves is needed.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
