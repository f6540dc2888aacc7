//! terra - build orchestrator for Fern applications
//!
//! This crate provides both a library and CLI for terra, including:
//! - Global configuration parsing and merging
//! - Project discovery (`fern.toml`)
//! - Support library fingerprinting and the per-backend artifact cache
//! - Compiler invocation for the native and web (emscripten) toolchains
//! - The platform build pipeline
//! - A local dev server for web builds

pub mod build;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod project;
pub mod serve;

pub use error::{Error, Result};
