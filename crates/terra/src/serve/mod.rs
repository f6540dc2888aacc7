//! Local dev server for web builds

pub mod http;
pub mod server;

pub use server::{DevServer, ServerHandle, ServerState, bind_with_retry};
