//! The device profiling client this crate drives, and the buffer callbacks it calls
//! back into.
use std::{fmt, sync::Arc};

use crate::{
    activity::{Kind, RecordBuffer},
    correlation::CorrelationId,
    error::TraceError,
};

/// Opaque handle of a device context, as issued by the device client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ContextHandle(pub u64);

/// A filled buffer handed back by the device client.
#[derive(Debug)]
pub struct BufferCompletion {
    pub context: ContextHandle,
    pub stream_id: u32,
    pub buffer: RecordBuffer,
}

/// Type of callback function the device client calls to obtain an empty buffer.
pub type BufferRequestFn = dyn Fn() -> Option<RecordBuffer> + Send + Sync;

/// Type of callback function the device client calls with a filled buffer.
pub type BufferCompleteFn = dyn Fn(BufferCompletion) + Send + Sync;

/// The buffer callbacks registered with the device client.
///
/// Pausing a trace swaps in [`BufferCallbacks::Disabled`], which hands out no buffers
/// and frees whatever it is handed.
#[derive(Clone, Default)]
pub enum BufferCallbacks {
    Enabled {
        request: Arc<BufferRequestFn>,
        complete: Arc<BufferCompleteFn>,
    },
    #[default]
    Disabled,
}

impl BufferCallbacks {
    pub fn enabled<R, C>(request: R, complete: C) -> Self
    where
        R: Fn() -> Option<RecordBuffer> + Send + Sync + 'static,
        C: Fn(BufferCompletion) + Send + Sync + 'static,
    {
        Self::Enabled {
            request: Arc::new(request),
            complete: Arc::new(complete),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, BufferCallbacks::Enabled { .. })
    }

    pub fn request(&self) -> Option<RecordBuffer> {
        match self {
            BufferCallbacks::Enabled { request, .. } => request(),
            BufferCallbacks::Disabled => None,
        }
    }

    pub fn complete(&self, completion: BufferCompletion) {
        match self {
            BufferCallbacks::Enabled { complete, .. } => complete(completion),
            BufferCallbacks::Disabled => drop(completion),
        }
    }
}

impl fmt::Debug for BufferCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BufferCallbacks::Enabled { .. } => "BufferCallbacks::Enabled",
            BufferCallbacks::Disabled => "BufferCallbacks::Disabled",
        })
    }
}

/// The vendor device profiling client.
///
/// Every call may fail; callers report failures through the error channel and carry
/// on. Implementations must be callable from any thread.
pub trait DeviceClient: Send + Sync {
    /// Start producing records of `kind` in `context`.
    fn enable_kind(&self, context: ContextHandle, kind: Kind) -> Result<(), TraceError>;

    /// Stop producing records of `kind` in `context`.
    fn disable_kind(&self, context: ContextHandle, kind: Kind) -> Result<(), TraceError>;

    /// Install the callbacks used to exchange buffers, replacing the previous ones.
    fn register_buffer_callbacks(&self, callbacks: BufferCallbacks) -> Result<(), TraceError>;

    /// Complete every buffer holding records. `forced` also completes partially
    /// filled buffers.
    fn flush_all(&self, forced: bool) -> Result<(), TraceError>;

    /// Push a host correlation id onto the calling thread's external correlation stack.
    fn push_external_correlation(&self, id: CorrelationId) -> Result<(), TraceError>;

    /// Pop the calling thread's external correlation stack, returning the popped id.
    fn pop_external_correlation(&self) -> Result<u64, TraceError>;

    /// Current device time in `context`.
    fn device_timestamp(&self, context: ContextHandle) -> Result<u64, TraceError>;

    /// Number of records dropped for lack of buffer space.
    fn dropped_record_count(
        &self,
        context: ContextHandle,
        stream_id: u32,
    ) -> Result<usize, TraceError>;

    /// Subscribe to the API entry/exit callbacks used for correlation.
    fn subscribe(&self) -> Result<(), TraceError>;

    fn unsubscribe(&self) -> Result<(), TraceError>;

    /// Release everything the client holds for this process.
    fn finalize(&self) -> Result<(), TraceError>;
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::HashSet,
        sync::{Mutex, MutexGuard},
    };

    use super::*;

    /// A call made on the [`MockClient`].
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum Call {
        Enable(ContextHandle, Kind),
        Disable(ContextHandle, Kind),
        Register { enabled: bool },
        Flush { forced: bool },
        Push(u64),
        Pop,
        Timestamp(ContextHandle),
        Dropped(ContextHandle, u32),
        Subscribe,
        Unsubscribe,
        Finalize,
    }

    #[derive(Default)]
    struct State {
        calls: Vec<Call>,
        failing_kinds: HashSet<Kind>,
        failing_functions: HashSet<&'static str>,
        callbacks: BufferCallbacks,
        correlation: Vec<u64>,
        dropped: usize,
        timestamp: u64,
    }

    /// A device client that records every call and fails on request.
    #[derive(Default)]
    pub(crate) struct MockClient {
        state: Mutex<State>,
    }

    impl MockClient {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap()
        }

        /// Make enable and disable calls for `kind` fail.
        pub(crate) fn fail_kind(&self, kind: Kind) {
            self.state().failing_kinds.insert(kind);
        }

        /// Make every call of the named trait function fail.
        pub(crate) fn fail_function(&self, function: &'static str) {
            self.state().failing_functions.insert(function);
        }

        pub(crate) fn set_dropped(&self, dropped: usize) {
            self.state().dropped = dropped;
        }

        pub(crate) fn set_timestamp(&self, timestamp: u64) {
            self.state().timestamp = timestamp;
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.state().calls.clone()
        }

        pub(crate) fn clear_calls(&self) {
            self.state().calls.clear();
        }

        pub(crate) fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
            self.state().calls.iter().filter(|c| f(c)).count()
        }

        pub(crate) fn correlation_depth(&self) -> usize {
            self.state().correlation.len()
        }

        /// Whether the most recently registered callbacks are enabled.
        pub(crate) fn delivering(&self) -> bool {
            self.state().callbacks.is_enabled()
        }

        /// Act as the producer: request a buffer through the registered callbacks.
        pub(crate) fn request_buffer(&self) -> Option<RecordBuffer> {
            let callbacks = self.state().callbacks.clone();
            callbacks.request()
        }

        /// Act as the producer: hand a filled buffer back.
        pub(crate) fn complete_buffer(&self, context: ContextHandle, buffer: RecordBuffer) {
            let callbacks = self.state().callbacks.clone();
            callbacks.complete(BufferCompletion {
                context,
                stream_id: 0,
                buffer,
            });
        }

        fn call(&self, function: &'static str, call: Call) -> Result<(), TraceError> {
            let mut state = self.state();
            state.calls.push(call);
            if state.failing_functions.contains(function) {
                Err(TraceError::client(function, "injected failure"))
            } else {
                Ok(())
            }
        }

        fn kind_call(&self, function: &'static str, call: Call, kind: Kind) -> Result<(), TraceError> {
            self.call(function, call)?;
            if self.state().failing_kinds.contains(&kind) {
                Err(TraceError::client(function, format!("{kind:?} not supported")))
            } else {
                Ok(())
            }
        }
    }

    impl DeviceClient for MockClient {
        fn enable_kind(&self, context: ContextHandle, kind: Kind) -> Result<(), TraceError> {
            self.kind_call("enable_kind", Call::Enable(context, kind), kind)
        }

        fn disable_kind(&self, context: ContextHandle, kind: Kind) -> Result<(), TraceError> {
            self.kind_call("disable_kind", Call::Disable(context, kind), kind)
        }

        fn register_buffer_callbacks(&self, callbacks: BufferCallbacks) -> Result<(), TraceError> {
            let enabled = callbacks.is_enabled();
            self.call("register_buffer_callbacks", Call::Register { enabled })?;
            self.state().callbacks = callbacks;
            Ok(())
        }

        fn flush_all(&self, forced: bool) -> Result<(), TraceError> {
            self.call("flush_all", Call::Flush { forced })
        }

        fn push_external_correlation(&self, id: CorrelationId) -> Result<(), TraceError> {
            self.call("push_external_correlation", Call::Push(id.get()))?;
            self.state().correlation.push(id.get());
            Ok(())
        }

        fn pop_external_correlation(&self) -> Result<u64, TraceError> {
            self.call("pop_external_correlation", Call::Pop)?;
            self.state()
                .correlation
                .pop()
                .ok_or_else(|| TraceError::client("pop_external_correlation", "stack empty"))
        }

        fn device_timestamp(&self, context: ContextHandle) -> Result<u64, TraceError> {
            self.call("device_timestamp", Call::Timestamp(context))?;
            Ok(self.state().timestamp)
        }

        fn dropped_record_count(
            &self,
            context: ContextHandle,
            stream_id: u32,
        ) -> Result<usize, TraceError> {
            self.call("dropped_record_count", Call::Dropped(context, stream_id))?;
            Ok(self.state().dropped)
        }

        fn subscribe(&self) -> Result<(), TraceError> {
            self.call("subscribe", Call::Subscribe)
        }

        fn unsubscribe(&self) -> Result<(), TraceError> {
            self.call("unsubscribe", Call::Unsubscribe)
        }

        fn finalize(&self) -> Result<(), TraceError> {
            self.call("finalize", Call::Finalize)
        }
    }

    #[test]
    fn disabled_callbacks_hand_out_nothing() -> Result<(), TraceError> {
        let callbacks = BufferCallbacks::Disabled;
        assert!(callbacks.request().is_none());
        callbacks.complete(BufferCompletion {
            context: ContextHandle(1),
            stream_id: 0,
            buffer: RecordBuffer::try_new(64, 8)?,
        });
        Ok(())
    }

    #[test]
    fn enabled_callbacks_forward() {
        let completed = Arc::new(Mutex::new(0usize));
        let completed_cb = Arc::clone(&completed);
        let callbacks = BufferCallbacks::enabled(
            || RecordBuffer::try_new(64, 8).ok(),
            move |c| *completed_cb.lock().unwrap() += c.buffer.capacity(),
        );

        let buffer = callbacks.request().unwrap();
        callbacks.complete(BufferCompletion {
            context: ContextHandle(1),
            stream_id: 0,
            buffer,
        });
        assert_eq!(*completed.lock().unwrap(), 64);
    }

    #[test]
    fn mock_injects_kind_failures() {
        let client = MockClient::new();
        client.fail_kind(Kind::Kernel);
        assert!(client.enable_kind(ContextHandle(1), Kind::Memcpy).is_ok());
        assert!(client.enable_kind(ContextHandle(1), Kind::Kernel).is_err());
        assert_eq!(client.count(|c| matches!(c, Call::Enable(..))), 2);
    }
}
