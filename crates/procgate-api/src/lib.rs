//! ProcGate API Library
//!
//! HTTP surface for the gateway: tool invocation and audit query routes,
//! correlation-id propagation, rate limiting, and the error boundary that
//! maps the failure taxonomy onto transport responses.

pub mod app;
pub mod error_boundary;
pub mod rate_limiting;
