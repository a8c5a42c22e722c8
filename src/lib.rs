//! Device activity tracing for accelerator offloading runtimes.
//!
//! This crate sits between a host parallel runtime and a vendor device profiling
//! client. It hands activity buffers to the client, drains the records the client
//! writes into them, correlates device records with host operations, and lets a tool
//! start, pause and stop tracing per device. It also answers introspection queries
//! about the host task and team hierarchy, see [`hierarchy`].
//!
//! Everything hangs off a [`Session`], created through [`Session::builder`]:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ompt_cupti::{Session, client::{ContextHandle, DeviceClient}};
//! # fn client() -> Arc<dyn DeviceClient> { unimplemented!() }
//! let session = Session::builder(client()).build()?;
//! let mut tracer = session.register_device(0, 0, ContextHandle(1));
//! tracer.start_trace(|records| {
//!     for record in records.records() {
//!         println!("{:?}", record.record_type());
//!     }
//! });
//! tracer.stop_trace();
//! # Ok::<(), ompt_cupti::error::TraceError>(())
//! ```
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::{debug, trace, warn};

use crate::{
    activity::{
        BufferPool, DeviceId, DeviceRecords, RecordBuffer,
        buffer::{DEFAULT_BUFFER_ALIGN, DEFAULT_BUFFER_SIZE},
        context_spans,
    },
    client::{BufferCallbacks, BufferCompletion, ContextHandle, DeviceClient},
    correlation::{
        ApiFunction, CorrelationFilter, HostOperations, Interceptor, OperationTickets,
        UniqueIdGenerator, UniqueIds,
    },
    error::{DroppedHandlerFn, ErrorChannel, ErrorReport, TraceError},
    monitoring::MonitoringRegistry,
    trace::{DeviceCompleteFn, DeviceRequestFn, DeviceTracer},
};

pub mod activity;
pub mod client;
pub mod correlation;
pub mod error;
pub mod hierarchy;
pub mod monitoring;
pub mod trace;

/// Module load events reported by the device client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ModuleEvent {
    Load,
    Unload,
}

/// Type of callback function notified when the device client loads or unloads a
/// code module. Receives the module id and its image.
pub type ModuleHookFn = dyn Fn(ModuleEvent, u64, &[u8]) + Send + Sync;

struct DeviceEntry {
    global_id: i32,
    context: ContextHandle,
    complete: Option<Arc<DeviceCompleteFn>>,
}

/// A tracing session: the device client, the buffer pool, the monitoring registry and
/// the registered devices.
///
/// A session is shared between the device client's callbacks and the tool, so it is
/// always handled through an [`Arc`].
pub struct Session {
    client: Arc<dyn DeviceClient>,
    errors: ErrorChannel,
    dropped: Arc<DroppedHandlerFn>,
    pool: BufferPool,
    registry: MonitoringRegistry,
    filter: Arc<CorrelationFilter>,
    forced_flush: bool,
    module_hook: Option<Box<ModuleHookFn>>,
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    request: RwLock<Option<Arc<DeviceRequestFn>>>,
    /// Callbacks registered with the client while any device is delivering.
    enabled: BufferCallbacks,
    /// Devices that started and have not stopped.
    active_traces: AtomicUsize,
    /// Devices currently started, as opposed to paused.
    delivering: AtomicUsize,
    tickets: Arc<OperationTickets>,
    unique_ids: UniqueIds,
}

impl Session {
    /// Return a builder to help set up a [Session] driving `client`.
    pub fn builder(client: Arc<dyn DeviceClient>) -> SessionBuilder {
        SessionBuilder::new(client)
    }

    pub fn client(&self) -> &dyn DeviceClient {
        self.client.as_ref()
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn registry(&self) -> &MonitoringRegistry {
        &self.registry
    }

    /// Number of device traces that started and have not stopped.
    pub fn active_traces(&self) -> usize {
        self.active_traces.load(Ordering::SeqCst)
    }

    /// Register a device and return its trace control.
    ///
    /// `relative_id` is the id the device client uses in context records, `global_id`
    /// the id the host runtime knows the device by. Registering an id again replaces
    /// the previous entry.
    pub fn register_device(
        self: &Arc<Self>,
        relative_id: DeviceId,
        global_id: i32,
        context: ContextHandle,
    ) -> DeviceTracer {
        debug!("register device {relative_id} as {global_id} with context {context:?}");
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                relative_id,
                DeviceEntry {
                    global_id,
                    context,
                    complete: None,
                },
            );
        DeviceTracer::new(Arc::clone(self), relative_id, global_id, context)
    }

    /// The context a registered device was registered with.
    pub fn device_context(&self, relative_id: DeviceId) -> Option<ContextHandle> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&relative_id)
            .map(|entry| entry.context)
    }

    /// A correlation interceptor for one worker.
    pub fn interceptor(&self) -> Interceptor {
        Interceptor::new(
            Arc::clone(&self.client),
            self.errors.clone(),
            Arc::clone(&self.filter),
        )
    }

    /// The host operation state of one worker.
    pub fn host_operations(&self) -> HostOperations {
        HostOperations::new(Arc::clone(&self.tickets))
    }

    /// A unique id generator for one worker.
    pub fn unique_ids(&self) -> UniqueIdGenerator {
        self.unique_ids.generator()
    }

    /// Called by the device client when it loads or unloads a code module.
    pub fn notify_module(&self, event: ModuleEvent, module_id: u64, image: &[u8]) {
        trace!("module {module_id} {event:?}, {} bytes", image.len());
        if let Some(hook) = &self.module_hook {
            hook(event, module_id, image);
        }
    }

    /// Obtain an empty buffer for the device client.
    pub fn request_buffer(&self) -> Option<RecordBuffer> {
        let request = self
            .request
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match request {
            Some(request) => request(&self.pool),
            None => self.pool.request(),
        }
    }

    /// Take back a filled buffer from the device client.
    ///
    /// Reports dropped records first, then hands the records of each device to that
    /// device's completion callback, then frees the buffer.
    pub fn complete_buffer(&self, completion: BufferCompletion) {
        let BufferCompletion {
            context,
            stream_id,
            buffer,
        } = completion;
        trace!(
            "buffer complete - stream id: {stream_id}, size: {}, valid: {}",
            buffer.capacity(),
            buffer.valid_size()
        );

        let dropped = self.errors.check(
            "dropped_record_count",
            self.client.dropped_record_count(context, stream_id),
        );
        if let Some(dropped) = dropped.filter(|dropped| *dropped > 0) {
            warn!("{dropped} activity records dropped");
            (self.dropped)(dropped);
        }

        let (spans, error) = context_spans(buffer.valid_bytes());
        let routes: Vec<_> = {
            let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
            spans
                .into_iter()
                .map(|span| {
                    let route = devices
                        .get(&span.device_id)
                        .map(|entry| (entry.global_id, entry.complete.clone()));
                    (span, route)
                })
                .collect()
        };
        for (span, route) in routes {
            match route {
                Some((global_id, Some(complete))) => complete(DeviceRecords::new(
                    global_id,
                    span.context_id,
                    &buffer.valid_bytes()[span.range],
                )),
                Some((_, None)) => trace!("device {} is not tracing", span.device_id),
                None => self
                    .errors
                    .report("buffer_complete", &TraceError::UnknownDevice(span.device_id)),
            }
        }
        if let Some(error) = error {
            self.errors.report("buffer_complete", &error);
        }
        drop(buffer);
    }

    pub(crate) fn set_request(&self, request: Arc<DeviceRequestFn>) {
        *self.request.write().unwrap_or_else(PoisonError::into_inner) = Some(request);
    }

    pub(crate) fn set_device_callback(
        &self,
        relative_id: DeviceId,
        complete: Option<Arc<DeviceCompleteFn>>,
    ) {
        if let Some(entry) = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&relative_id)
        {
            entry.complete = complete;
        }
    }

    /// A device trace started: subscribe for correlation if it is the first.
    pub(crate) fn acquire(&self) {
        if self.active_traces.fetch_add(1, Ordering::SeqCst) == 0 {
            debug!("first trace started, subscribing");
            self.errors.check("subscribe", self.client.subscribe());
        }
    }

    /// A device trace stopped: release the device client if it was the last.
    pub(crate) fn release(&self) {
        if self.active_traces.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("last trace stopped, finalizing device client");
            self.errors.check("unsubscribe", self.client.unsubscribe());
            self.errors.check("finalize", self.client.finalize());
        }
    }

    pub(crate) fn begin_delivery(&self) {
        self.delivering.fetch_add(1, Ordering::SeqCst);
        trace!("registering enabled buffer callbacks");
        self.errors.check(
            "register_buffer_callbacks",
            self.client.register_buffer_callbacks(self.enabled.clone()),
        );
    }

    pub(crate) fn end_delivery(&self) {
        if self.delivering.fetch_sub(1, Ordering::SeqCst) == 1 {
            trace!("registering disabled buffer callbacks");
            self.errors.check(
                "register_buffer_callbacks",
                self.client
                    .register_buffer_callbacks(BufferCallbacks::Disabled),
            );
        }
    }

    pub(crate) fn flush(&self) -> bool {
        trace!("flushing activity buffers");
        self.errors
            .check("flush_all", self.client.flush_all(self.forced_flush))
            .is_some()
    }

    pub(crate) fn device_time(&self, context: ContextHandle) -> Option<u64> {
        self.errors
            .check("device_timestamp", self.client.device_timestamp(context))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("pool", &self.pool)
            .field("forced_flush", &self.forced_flush)
            .field("active_traces", &self.active_traces())
            .finish_non_exhaustive()
    }
}

/// Builder to help initialize a [Session].
pub struct SessionBuilder {
    client: Arc<dyn DeviceClient>,
    buffer_size: usize,
    buffer_align: usize,
    forced_flush: bool,
    errors: Option<ErrorChannel>,
    dropped: Option<Arc<DroppedHandlerFn>>,
    module_hook: Option<Box<ModuleHookFn>>,
    correlated: Option<CorrelationFilter>,
}

impl SessionBuilder {
    pub fn new(client: Arc<dyn DeviceClient>) -> Self {
        Self {
            client,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_align: DEFAULT_BUFFER_ALIGN,
            forced_flush: true,
            errors: None,
            dropped: None,
            module_hook: None,
            correlated: None,
        }
    }

    /// Size of each activity buffer. Defaults to 64 KiB.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Alignment of each activity buffer, a power of two. Defaults to 8.
    pub fn with_buffer_align(mut self, align: usize) -> Self {
        self.buffer_align = align;
        self
    }

    /// Whether flushes also complete partially filled buffers. Enabled by default.
    pub fn with_forced_flush(mut self, forced: bool) -> Self {
        self.forced_flush = forced;
        self
    }

    /// Set the error handler.
    ///
    /// Without one, errors are logged, printed to stderr, and terminate the process.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.errors = Some(ErrorChannel::new(handler));
        self
    }

    /// Set the handler notified with the number of records the device client dropped.
    pub fn with_dropped_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.dropped = Some(Arc::new(handler));
        self
    }

    pub fn with_module_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(ModuleEvent, u64, &[u8]) + Send + Sync + 'static,
    {
        self.module_hook = Some(Box::new(hook));
        self
    }

    /// Replace the set of API functions whose calls are correlated.
    pub fn with_correlated_functions(
        mut self,
        functions: impl IntoIterator<Item = ApiFunction>,
    ) -> Self {
        self.correlated = Some(CorrelationFilter::new(functions));
        self
    }

    /// Build the [Session].
    pub fn build(self) -> Result<Arc<Session>, TraceError> {
        if self.buffer_size == 0 {
            return Err(TraceError::Builder("buffer size must be non-zero".into()));
        }
        if !self.buffer_align.is_power_of_two() {
            return Err(TraceError::Builder(format!(
                "buffer alignment {} is not a power of two",
                self.buffer_align
            )));
        }
        let errors = self.errors.unwrap_or_default();
        let pool = BufferPool::new(self.buffer_size, self.buffer_align, errors.clone())?;
        let dropped = self.dropped.unwrap_or_else(|| {
            Arc::new(|dropped| warn!("dropped {dropped} activity records"))
        });
        trace!(
            "building session: buffer size {}, align {}, forced flush {}",
            self.buffer_size, self.buffer_align, self.forced_flush
        );

        Ok(Arc::new_cyclic(|weak: &Weak<Session>| {
            let request_session = weak.clone();
            let complete_session = weak.clone();
            let enabled = BufferCallbacks::enabled(
                move || request_session.upgrade()?.request_buffer(),
                move |completion| match complete_session.upgrade() {
                    Some(session) => session.complete_buffer(completion),
                    None => drop(completion),
                },
            );
            Session {
                client: self.client,
                errors,
                dropped,
                pool,
                registry: MonitoringRegistry::new(),
                filter: Arc::new(self.correlated.unwrap_or_default()),
                forced_flush: self.forced_flush,
                module_hook: self.module_hook,
                devices: RwLock::new(HashMap::new()),
                request: RwLock::new(None),
                enabled,
                active_traces: AtomicUsize::new(0),
                delivering: AtomicUsize::new(0),
                tickets: OperationTickets::new(),
                unique_ids: UniqueIds::new(),
            }
        }))
    }
}
