//! Integration tests for policy-router
//!
//! This module contains integration tests that drive the public API against an
//! in-memory kernel.
//!
//! # Test Organization
//!
//! - `fake_kernel`: rtnetlink decoder holding rule and route sets
//! - `policy_routing`: end-to-end rule, route, and lifecycle tests
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run tests against the real kernel (marked with #[ignore])
//! sudo -E cargo test --test integration_tests -- --ignored
//! ```
//!
//! # Test Requirements
//!
//! - Most tests use the fake kernel and need no privileges
//! - Tests marked with `#[ignore]` require CAP_NET_ADMIN

pub mod fake_kernel;
pub mod policy_routing;
