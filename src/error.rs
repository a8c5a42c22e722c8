//! Error types and the error channel used by this crate.
//!
//! Tracing must never change the behavior of the program it observes, so none of the
//! failures below are propagated across the host runtime / device client boundary.
//! They are reported through an [`ErrorChannel`] at the point where they occur.

use std::{fmt, sync::Arc};

use thiserror::Error;
use tracing::{error, warn};

/// Tracing error kinds
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    /// A call into the device profiling client returned a failure status.
    #[error("{function} failed: {message}")]
    Client {
        function: &'static str,
        message: String,
    },
    /// An activity buffer could not be allocated.
    #[error("out of memory allocating {size} byte activity buffer")]
    Allocation { size: usize },
    /// The requested buffer size or alignment does not form a valid layout.
    #[error("invalid activity buffer layout: size {size}, align {align}")]
    InvalidLayout { size: usize, align: usize },
    /// A record header inside the valid region of a buffer is malformed.
    #[error("corrupt activity record at offset {offset}")]
    CorruptRecord { offset: usize },
    /// A record is shorter than the layout of its kind requires.
    #[error("truncated {kind} record: {len} bytes, need {required}")]
    Truncated {
        kind: &'static str,
        len: usize,
        required: usize,
    },
    /// No device was registered under this relative id.
    #[error("unknown device {0}")]
    UnknownDevice(u32),
    /// An error attempting to build a session. Typically a misconfiguration issue.
    #[error("builder: {0}")]
    Builder(String),
}

impl TraceError {
    /// Shorthand for a failed device client call.
    pub fn client(function: &'static str, message: impl Into<String>) -> Self {
        Self::Client {
            function,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TraceError::Client { .. } => ErrorCategory::DeviceClient,
            TraceError::Allocation { .. } | TraceError::InvalidLayout { .. } => {
                ErrorCategory::Resource
            }
            TraceError::CorruptRecord { .. }
            | TraceError::Truncated { .. }
            | TraceError::UnknownDevice(_)
            | TraceError::Builder(_) => ErrorCategory::Protocol,
        }
    }
}

/// Coarse classification of a reported failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ErrorCategory {
    /// A call into the device profiling client failed.
    DeviceClient,
    /// A resource such as an activity buffer could not be obtained.
    Resource,
    /// The record stream or an API was used outside of its contract.
    Protocol,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::DeviceClient => "device client error",
            ErrorCategory::Resource => "resource error",
            ErrorCategory::Protocol => "protocol error",
        })
    }
}

/// A single failure as delivered to the error callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    /// Name of the operation that failed.
    pub function: &'static str,
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: function {} failed with error {}",
            self.category, self.function, self.message
        )
    }
}

/// Type of callback function used to receive [`ErrorReport`]s.
pub type ErrorHandlerFn = dyn Fn(&ErrorReport) + Send + Sync;

/// Type of callback function notified about records dropped by the producer.
pub type DroppedHandlerFn = dyn Fn(usize) + Send + Sync;

/// Cloneable handle through which every non-fatal failure is reported.
#[derive(Clone)]
pub struct ErrorChannel {
    handler: Arc<ErrorHandlerFn>,
}

impl ErrorChannel {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// The fail-fast channel: print the report and terminate the process.
    pub fn fail_fast() -> Self {
        Self::new(|report| {
            error!("{report}");
            eprintln!("{report}");
            std::process::exit(-1);
        })
    }

    /// Report a failure of `function`.
    pub fn report(&self, function: &'static str, error: &TraceError) {
        warn!("{function}: {error}");
        (self.handler)(&ErrorReport {
            category: error.category(),
            function,
            message: error.to_string(),
        });
    }

    /// Report the error of `result`, if any, and hand back the success value.
    pub fn check<T>(&self, function: &'static str, result: Result<T, TraceError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.report(function, &error);
                None
            }
        }
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::fail_fast()
    }
}

impl fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannel").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use super::*;

    /// An error channel that records every report instead of exiting.
    pub(crate) fn collecting_channel() -> (ErrorChannel, Arc<Mutex<Vec<ErrorReport>>>) {
        let reports: Arc<Mutex<Vec<ErrorReport>>> = Arc::new(Mutex::new(vec![]));
        let reports_cb = Arc::clone(&reports);
        let channel = ErrorChannel::new(move |report| {
            reports_cb.lock().unwrap().push(report.clone());
        });
        (channel, reports)
    }

    #[test]
    fn categories() {
        assert_eq!(
            TraceError::client("enable_kind", "busy").category(),
            ErrorCategory::DeviceClient
        );
        assert_eq!(
            TraceError::Allocation { size: 8 }.category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            TraceError::CorruptRecord { offset: 16 }.category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn check_reports_and_discards_errors() {
        let (channel, reports) = collecting_channel();

        assert_eq!(channel.check("ok", Ok::<_, TraceError>(3)), Some(3));
        assert_eq!(
            channel.check::<u32>("flush_all", Err(TraceError::client("flush_all", "busy"))),
            None
        );

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].function, "flush_all");
        assert_eq!(reports[0].category, ErrorCategory::DeviceClient);
        assert_eq!(reports[0].message, "flush_all failed: busy");
    }
}
