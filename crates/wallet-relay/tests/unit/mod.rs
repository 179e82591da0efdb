//! Unit tests module

pub mod envelope_test;
pub mod storage_test;
