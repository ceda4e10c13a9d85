//! Utility functions and helpers

pub mod file;
pub mod retry;
pub mod time;
