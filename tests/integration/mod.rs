//! Integration tests for mysql-gate.

pub mod gateway_test;
pub mod live_test;
pub mod pool_test;
pub mod session_test;
