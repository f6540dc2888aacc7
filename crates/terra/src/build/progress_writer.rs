//! Writer that integrates tracing output with indicatif progress bars
//!
//! Log lines are written with the progress bars suspended, so they land above
//! the stage spinner instead of tearing it.

use indicatif::MultiProgress;
use std::io::{self, Write};
use tracing_subscriber::fmt::MakeWriter;

/// Writer that suspends progress bars while writing logs
#[derive(Clone)]
pub struct ProgressWriter {
    multi: MultiProgress,
}

impl ProgressWriter {
    pub fn new(multi: MultiProgress) -> Self {
        Self { multi }
    }
}

impl MakeWriter<'_> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'_ self) -> Self::Writer {
        self.clone()
    }
}

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.multi.suspend(|| io::stderr().lock().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.multi.suspend(|| io::stderr().lock().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Writer for a tracing `fmt` layer sharing `multi` with the build progress
pub fn make_writer(multi: &MultiProgress) -> ProgressWriter {
    ProgressWriter::new(multi.clone())
}
