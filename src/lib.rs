//! Market Gate - request admission control for a marketplace API server
//!
//! This crate throttles clients with per-key fixed-window counters under a
//! set of named policies, and authorizes mutation requests against the
//! recorded owner of the resource they touch. Both are exposed as axum
//! middleware.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod request;
