//! Fuzz tests module
//!
//! Property-based testing using proptest to find edge cases:
//! - Frame decoding
//! - Routing decisions

pub mod frame_fuzz;
