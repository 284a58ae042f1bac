//! Shared utilities

pub mod retry;
pub mod shutdown;
