//! Core tollgate library (event routing, permission gate, config).

pub mod config;
pub mod core;
pub mod logging;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
