//! Invariant tests module
//!
//! This module contains tests that verify critical invariants:
//! - An approval resolves at most once
//! - Only the latest shown request is visible

pub mod approval_invariant;
