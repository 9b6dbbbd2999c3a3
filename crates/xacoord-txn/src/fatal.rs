//! Policy for errors that make recovery correctness impossible

use tracing::error;

/// Invoked when a resource factory fails with anything but unavailability
pub trait FatalErrorHandler: Send + Sync {
    fn on_fatal(&self, message: &str);
}

/// Logs the error and aborts the process
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortProcess;

impl FatalErrorHandler for AbortProcess {
    fn on_fatal(&self, message: &str) {
        error!("Unrecoverable transaction service error, terminating: {}", message);
        std::process::abort();
    }
}
