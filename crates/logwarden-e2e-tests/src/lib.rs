//! End-to-end integration tests for logwarden.
//!
//! These tests run the full pipeline against local HTTP fakes:
//! - Token acquisition from the identity service
//! - Log queries, paging and counts
//! - Rate limiting, retries and the circuit breaker
//! - Timeout recovery by window narrowing

#![cfg(test)]
