//! Integration tests for the multinet access layer
//!
//! These tests drive `MultiRequest` end to end against in-process
//! `MockBackend`s standing in for the ADO, CDEV and HTTP protocols.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p multinet-tests
//!
//! # with routing and dispatch logs
//! RUST_LOG=multinet_gateway=debug cargo test -p multinet-tests -- --nocapture
//! ```
//!
//! # Test Structure
//!
//! - `multirequest_test.rs` - get/set/meta routing, ordering and error isolation
//! - `subscription_test.rs` - grouping, immediate delivery, dispatch ordering,
//!   cancellation and callback failures

// This crate only contains tests, no library code
