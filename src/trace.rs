//! Per-device trace control: start, pause, resume and stop.
use std::{fmt, sync::Arc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    Session,
    activity::{BufferPool, DeviceId, DeviceRecords, Kind, RecordBuffer},
    client::ContextHandle,
    monitoring::{KindSet, NativeTraceStatus, SetStatus},
};

/// Type of callback function supplying empty buffers for a device.
pub type DeviceRequestFn = dyn Fn(&BufferPool) -> Option<RecordBuffer> + Send + Sync;

/// Type of callback function receiving the records of one device. The records are
/// borrowed and released once the callback returns.
pub type DeviceCompleteFn = dyn Fn(DeviceRecords<'_>) + Send + Sync;

/// Lifecycle of a device trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum TraceState {
    Uninitialized,
    Initialized,
    Started,
    Paused,
    Stopped,
}

/// Trace control for one device.
///
/// Operations report success as `bool`; failures of the device client underneath are
/// reported through the session's error channel. Dropping a started or paused tracer
/// stops it.
pub struct DeviceTracer {
    session: Arc<Session>,
    device_id: DeviceId,
    global_id: i32,
    context: ContextHandle,
    state: TraceState,
    /// Kinds that were enabled when the trace was paused.
    paused_kinds: Vec<Kind>,
}

impl DeviceTracer {
    pub(crate) fn new(
        session: Arc<Session>,
        device_id: DeviceId,
        global_id: i32,
        context: ContextHandle,
    ) -> Self {
        Self {
            session,
            device_id,
            global_id,
            context,
            state: TraceState::Uninitialized,
            paused_kinds: Vec::new(),
        }
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    /// Relative id of the device within the device client.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn global_id(&self) -> i32 {
        self.global_id
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Prepare the trace. Repeated calls have no further effect; a stopped trace
    /// cannot be initialized again.
    pub fn init(&mut self) -> bool {
        match self.state {
            TraceState::Uninitialized => {
                trace!("device {}: initialized", self.device_id);
                self.state = TraceState::Initialized;
                true
            }
            TraceState::Stopped => false,
            TraceState::Initialized | TraceState::Started | TraceState::Paused => true,
        }
    }

    /// Start tracing with buffers taken from the session's pool.
    pub fn start_trace<C>(&mut self, complete: C) -> bool
    where
        C: Fn(DeviceRecords<'_>) + Send + Sync + 'static,
    {
        self.start_trace_with(BufferPool::request, complete)
    }

    /// Start tracing with a custom buffer request function.
    ///
    /// The device client holds a single buffer request callback, so the request
    /// function of the most recently started device serves every device.
    pub fn start_trace_with<R, C>(&mut self, request: R, complete: C) -> bool
    where
        R: Fn(&BufferPool) -> Option<RecordBuffer> + Send + Sync + 'static,
        C: Fn(DeviceRecords<'_>) + Send + Sync + 'static,
    {
        if !self.init() {
            return false;
        }
        self.session.set_request(Arc::new(request));
        self.session.set_device_callback(self.device_id, Some(Arc::new(complete)));
        match self.state {
            TraceState::Initialized => {
                self.session.acquire();
                self.session.begin_delivery();
                self.state = TraceState::Started;
                debug!("device {}: trace started", self.device_id);
                true
            }
            TraceState::Paused => self.pause_trace(false),
            TraceState::Started => true,
            TraceState::Uninitialized | TraceState::Stopped => false,
        }
    }

    /// Pause (`begin == true`) or resume (`begin == false`) the trace.
    ///
    /// Pausing flushes outstanding buffers, disables every kind enabled in this
    /// context and stops buffer delivery. Resuming re-enables exactly the kinds that
    /// were enabled when the trace was paused. Calls that do not match the current
    /// state return false and change nothing.
    pub fn pause_trace(&mut self, begin: bool) -> bool {
        match (begin, self.state) {
            (true, TraceState::Started) => {
                self.session.flush();
                let registry = self.session.registry();
                self.paused_kinds = registry.enabled_kinds(self.context);
                registry.set_kinds(
                    self.session.client(),
                    self.session.errors(),
                    self.context,
                    self.paused_kinds.iter().copied(),
                    false,
                );
                self.session.end_delivery();
                self.state = TraceState::Paused;
                debug!(
                    "device {}: trace paused with {} kinds enabled",
                    self.device_id,
                    self.paused_kinds.len()
                );
                true
            }
            (false, TraceState::Paused) => {
                self.session.begin_delivery();
                let kinds = std::mem::take(&mut self.paused_kinds);
                self.session.registry().set_kinds(
                    self.session.client(),
                    self.session.errors(),
                    self.context,
                    kinds,
                    true,
                );
                self.state = TraceState::Started;
                debug!("device {}: trace resumed", self.device_id);
                true
            }
            _ => false,
        }
    }

    /// Stop the trace for good.
    ///
    /// Stopping pauses a started trace, forgets the monitoring state of the context and
    /// releases this device's share of the session. The last trace to stop releases
    /// the device client subscriptions.
    pub fn stop_trace(&mut self) -> bool {
        if self.state == TraceState::Started {
            self.pause_trace(true);
        }
        match self.state {
            TraceState::Paused => {
                self.session.registry().clear(self.context);
                self.session.set_device_callback(self.device_id, None);
                self.paused_kinds.clear();
                self.session.release();
                self.state = TraceState::Stopped;
                debug!("device {}: trace stopped", self.device_id);
            }
            TraceState::Uninitialized | TraceState::Initialized => {
                self.state = TraceState::Stopped;
            }
            TraceState::Started | TraceState::Stopped => {}
        }
        true
    }

    /// Force completion of all buffers holding records.
    pub fn flush_trace(&self) -> bool {
        self.session.flush()
    }

    /// Current device time, or `None` if the device client cannot tell.
    pub fn get_device_time(&self) -> Option<u64> {
        self.session.device_time(self.context)
    }

    pub fn set_monitoring(&self, set: &KindSet, enable: bool) -> SetStatus {
        self.session.registry().set_monitoring(
            self.session.client(),
            self.session.errors(),
            self.context,
            set,
            enable,
        )
    }

    /// Enable or disable native record categories, see
    /// [`crate::monitoring::MonitoringRegistry::set_trace_native`].
    pub fn set_trace_native(&self, flags: u32, enable: bool) -> NativeTraceStatus {
        self.session.registry().set_trace_native(
            self.session.client(),
            self.session.errors(),
            self.context,
            flags,
            enable,
        )
    }
}

impl Drop for DeviceTracer {
    fn drop(&mut self) {
        if matches!(self.state, TraceState::Started | TraceState::Paused) {
            warn!("device {}: tracer dropped while tracing, stopping", self.device_id);
            self.stop_trace();
        }
    }
}

impl fmt::Debug for DeviceTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTracer")
            .field("device_id", &self.device_id)
            .field("global_id", &self.global_id)
            .field("context", &self.context)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        client::test::{Call, MockClient},
        monitoring::{DATA_MOTION_EXPLICIT, KERNEL_INVOCATION},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn setup() -> Result<(Arc<MockClient>, Arc<Session>), crate::error::TraceError> {
        let client = Arc::new(MockClient::new());
        let session = Session::builder(client.clone())
            .with_error_handler(|_| {})
            .build()?;
        Ok((client, session))
    }

    #[test]
    fn lifecycle() -> TestResult {
        let (client, session) = setup()?;
        let mut tracer = session.register_device(0, 0, ContextHandle(1));
        assert_eq!(tracer.state(), TraceState::Uninitialized);

        assert!(tracer.start_trace(|_| {}));
        assert_eq!(tracer.state(), TraceState::Started);
        assert_eq!(session.active_traces(), 1);
        assert!(client.delivering());

        assert!(tracer.pause_trace(true));
        assert_eq!(tracer.state(), TraceState::Paused);
        assert!(!client.delivering());
        assert!(!tracer.pause_trace(true));

        assert!(tracer.pause_trace(false));
        assert_eq!(tracer.state(), TraceState::Started);
        assert!(client.delivering());

        assert!(tracer.stop_trace());
        assert_eq!(tracer.state(), TraceState::Stopped);
        assert_eq!(session.active_traces(), 0);
        assert!(!tracer.start_trace(|_| {}));
        Ok(())
    }

    #[test]
    fn resume_restores_enabled_kinds() -> TestResult {
        let (client, session) = setup()?;
        let ctx = ContextHandle(3);
        let mut tracer = session.register_device(0, 0, ctx);
        tracer.start_trace(|_| {});
        assert_eq!(tracer.set_monitoring(&KERNEL_INVOCATION, true), SetStatus::All);
        assert_eq!(tracer.set_monitoring(&DATA_MOTION_EXPLICIT, true), SetStatus::All);
        let before = session.registry().enabled_kinds(ctx);

        tracer.pause_trace(true);
        assert!(session.registry().enabled_kinds(ctx).is_empty());
        assert_eq!(client.count(|c| matches!(c, Call::Disable(..))), 2);
        assert_eq!(client.count(|c| *c == Call::Flush { forced: true }), 1);

        tracer.pause_trace(false);
        assert_eq!(session.registry().enabled_kinds(ctx), before);
        Ok(())
    }

    #[test]
    fn finalizes_once_when_last_trace_stops() -> TestResult {
        let (client, session) = setup()?;
        let mut first = session.register_device(0, 0, ContextHandle(1));
        let mut second = session.register_device(1, 1, ContextHandle(2));
        first.start_trace(|_| {});
        second.start_trace(|_| {});
        assert_eq!(session.active_traces(), 2);
        assert_eq!(client.count(|c| *c == Call::Subscribe), 1);

        first.stop_trace();
        first.stop_trace();
        assert_eq!(session.active_traces(), 1);
        assert_eq!(client.count(|c| *c == Call::Finalize), 0);
        assert!(client.delivering());

        second.pause_trace(true);
        second.stop_trace();
        assert_eq!(session.active_traces(), 0);
        assert_eq!(client.count(|c| *c == Call::Finalize), 1);
        assert_eq!(client.count(|c| *c == Call::Unsubscribe), 1);
        Ok(())
    }

    #[test]
    fn stop_without_start_keeps_counter() -> TestResult {
        let (client, session) = setup()?;
        let mut tracer = session.register_device(0, 0, ContextHandle(1));
        assert!(tracer.stop_trace());
        assert_eq!(session.active_traces(), 0);
        assert!(client.calls().is_empty());
        Ok(())
    }

    #[test]
    fn device_time_none_on_failure() -> TestResult {
        let (client, session) = setup()?;
        let tracer = session.register_device(0, 0, ContextHandle(1));
        client.set_timestamp(1234);
        assert_eq!(tracer.get_device_time(), Some(1234));
        client.fail_function("device_timestamp");
        assert_eq!(tracer.get_device_time(), None);
        Ok(())
    }

    #[test]
    fn drop_stops_trace() -> TestResult {
        let (client, session) = setup()?;
        {
            let mut tracer = session.register_device(0, 0, ContextHandle(1));
            tracer.start_trace(|_| {});
        }
        assert_eq!(session.active_traces(), 0);
        assert_eq!(client.count(|c| *c == Call::Finalize), 1);
        Ok(())
    }

    #[test]
    fn custom_request_function_serves_buffers() -> TestResult {
        let (client, session) = setup()?;
        let requested = Arc::new(Mutex::new(0));
        let requested_cb = Arc::clone(&requested);
        let mut tracer = session.register_device(0, 0, ContextHandle(1));
        tracer.start_trace_with(
            move |pool: &BufferPool| {
                *requested_cb.lock().unwrap() += 1;
                RecordBuffer::try_new(pool.buffer_size() / 2, pool.buffer_align()).ok()
            },
            |_| {},
        );
        let buffer = client.request_buffer().ok_or("no buffer")?;
        assert_eq!(buffer.capacity(), session.pool().buffer_size() / 2);
        assert_eq!(*requested.lock().unwrap(), 1);

        tracer.pause_trace(true);
        assert!(client.request_buffer().is_none());
        Ok(())
    }
}
