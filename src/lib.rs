//! Turnstile - Distributed Request-Rate Admission Control
//!
//! This crate puts an admission check in front of an HTTP service. Every
//! request is attributed to an identity (an API token, or the client address)
//! and counted against a fixed window held in a shared counter store, so that
//! any number of service instances enforce one common limit.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
