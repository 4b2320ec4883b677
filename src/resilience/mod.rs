//! Resilience helpers for local infrastructure.

pub mod retry;
