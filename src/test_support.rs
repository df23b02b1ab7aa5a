//! Log capture for tests that assert on diagnostics.

use std::io;
use std::sync::{Arc, Mutex};

use tracing::Dispatch;
use tracing::subscriber::DefaultGuard;

/// Shared buffer the capturing subscriber writes into.
#[derive(Clone, Default)]
pub(crate) struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A dispatcher writing plain-text events into the returned buffer.
pub(crate) fn log_dispatch() -> (Dispatch, LogBuffer) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (Dispatch::new(subscriber), buffer)
}

/// Routes this thread's events into a buffer until the guard drops.
pub(crate) fn capture_logs() -> (DefaultGuard, LogBuffer) {
    let (dispatch, buffer) = log_dispatch();
    (tracing::dispatcher::set_default(&dispatch), buffer)
}
