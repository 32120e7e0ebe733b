//! Crate test support and the scripted-hardware acquisition harness.

pub mod fake;
