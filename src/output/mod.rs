//! Output handling
//!
//! Writer and output interceptor collaborators, plus report formatters.

mod formatter;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::parallel::ParallelClient;

pub use formatter::{write_report_to_file, OutputFormat, ReportFormatter};

/// Buffer that node bodies write diagnostic output to
pub trait Writer: Send + Sync {
    fn write(&self, bytes: &[u8]);
    fn truncate(&self);
    fn bytes(&self) -> Vec<u8>;
}

/// In-memory writer
#[derive(Debug, Default)]
pub struct BufferedWriter {
    buffer: Mutex<Vec<u8>>,
}

impl BufferedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn println(&self, line: impl AsRef<str>) {
        let mut buffer = self.buffer.lock();
        buffer.extend_from_slice(line.as_ref().as_bytes());
        buffer.push(b'\n');
    }
}

impl Writer for BufferedWriter {
    fn write(&self, bytes: &[u8]) {
        self.buffer.lock().extend_from_slice(bytes);
    }

    fn truncate(&self) {
        self.buffer.lock().clear();
    }

    fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }
}

/// Captures the process stdout/stderr while a node runs
pub trait OutputInterceptor: Send + Sync {
    fn start_intercepting_output(&self);

    /// Intercept and forward output live to the parallel client
    fn start_intercepting_output_and_forward_to(&self, client: Arc<dyn ParallelClient>);

    fn stop_intercepting_and_return_output(&self) -> String;
}

/// Interceptor that captures nothing
#[derive(Debug, Default)]
pub struct NoopOutputInterceptor;

impl OutputInterceptor for NoopOutputInterceptor {
    fn start_intercepting_output(&self) {}

    fn start_intercepting_output_and_forward_to(&self, _client: Arc<dyn ParallelClient>) {}

    fn stop_intercepting_and_return_output(&self) -> String {
        String::new()
    }
}
