//! Build orchestration
//!
//! - [`process`]: managed child processes with output capture
//! - [`toolchain`]: the compiler invoker for both backends
//! - [`pipeline`]: fingerprint, cache check, library and project builds
//! - [`progress`], [`progress_writer`]: terminal progress display

pub mod pipeline;
pub mod process;
pub mod progress;
pub mod progress_writer;
pub mod toolchain;

pub use pipeline::{BuildRequest, BuildResult, BuildTarget, LibraryOutcome, Pipeline, Stage};
pub use process::{CommandOutput, LogCallback, ManagedChild, run_command_with_logging};
pub use progress::BuildProgress;
pub use progress_writer::make_writer;
pub use toolchain::{CompileOutput, CompileRequest, ExternalToolchain, OutputKind, Toolchain};
