//! End-to-end integration tests for Open Hydra.
//!
//! These tests exercise the full stack over a real listener:
//! - Server startup and shutdown
//! - Authentication, role masks and ownership
//! - Device create, observe and delete against the in-memory platform
//! - User and settings management

#![cfg(test)]
