//! Test support for terra end-to-end tests
//!
//! - [`fake_toolchain`]: shell scripts standing in for the compilers and archivers
//! - [`ports`]: helpers for occupying local ports

pub mod fake_toolchain;
pub mod ports;

pub use fake_toolchain::{FakeToolchain, Sandbox};
