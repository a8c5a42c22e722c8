use std::sync::{Arc, Mutex, PoisonError};

use ompt_cupti::{
    ModuleEvent, Session,
    activity::{
        self, AbstractRecord, DispatchTable, Kind, Record, RecordRef, context, external, kernel,
    },
    client::{BufferCallbacks, BufferCompletion, ContextHandle, DeviceClient},
    correlation::{ApiFunction, ApiSite, CorrelationId},
    error::TraceError,
    monitoring::NativeCategories,
};
use tracing::level_filters::LevelFilter;

/// A device that "runs" kernels on demand and writes their records into the buffers
/// handed to it, the way a vendor profiling client would.
#[derive(Default)]
struct SimulatedDevice {
    state: Mutex<DeviceState>,
}

#[derive(Default)]
struct DeviceState {
    callbacks: BufferCallbacks,
    enabled: Vec<Kind>,
    correlation: Vec<u64>,
    pending: Vec<Vec<u8>>,
    clock: u64,
    next_correlation: u32,
}

const CONTEXT: ContextHandle = ContextHandle(0xc0);

impl SimulatedDevice {
    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute a kernel, producing its records if kernels are being traced.
    fn launch(&self) {
        let mut state = self.state();
        state.next_correlation += 1;
        state.clock += 1_000;
        let correlation_id = state.next_correlation;
        let start = state.clock;

        if state.enabled.contains(&Kind::ExternalCorrelation)
            && let Some(&external_id) = state.correlation.last()
        {
            let record = external::Record {
                external_kind: external::Kind::Custom0,
                correlation_id,
                external_id,
            };
            state.pending.push(record.to_bytes());
        }
        if state.enabled.contains(&Kind::Kernel) {
            let record = kernel::Record {
                start,
                end: start + 250,
                correlation_id,
                grid_x: 64,
                block_x: 128,
                ..Default::default()
            };
            state.pending.push(record.to_bytes());
        }
    }
}

impl DeviceClient for SimulatedDevice {
    fn enable_kind(&self, _context: ContextHandle, kind: Kind) -> Result<(), TraceError> {
        let mut state = self.state();
        if !state.enabled.contains(&kind) {
            state.enabled.push(kind);
        }
        Ok(())
    }

    fn disable_kind(&self, _context: ContextHandle, kind: Kind) -> Result<(), TraceError> {
        self.state().enabled.retain(|k| *k != kind);
        Ok(())
    }

    fn register_buffer_callbacks(&self, callbacks: BufferCallbacks) -> Result<(), TraceError> {
        self.state().callbacks = callbacks;
        Ok(())
    }

    fn flush_all(&self, _forced: bool) -> Result<(), TraceError> {
        let (callbacks, pending) = {
            let mut state = self.state();
            (state.callbacks.clone(), std::mem::take(&mut state.pending))
        };
        if pending.is_empty() {
            return Ok(());
        }
        let Some(mut buffer) = callbacks.request() else {
            return Err(TraceError::client("flush_all", "no buffer available"));
        };
        buffer.push_record(
            &context::Record {
                context_id: 1,
                device_id: 0,
                ..Default::default()
            }
            .to_bytes(),
        );
        for record in &pending {
            if !buffer.push_record(record) {
                tracing::warn!("buffer full, dropping record");
            }
        }
        callbacks.complete(BufferCompletion {
            context: CONTEXT,
            stream_id: 0,
            buffer,
        });
        Ok(())
    }

    fn push_external_correlation(&self, id: CorrelationId) -> Result<(), TraceError> {
        self.state().correlation.push(id.get());
        Ok(())
    }

    fn pop_external_correlation(&self) -> Result<u64, TraceError> {
        self.state()
            .correlation
            .pop()
            .ok_or_else(|| TraceError::client("pop_external_correlation", "stack empty"))
    }

    fn device_timestamp(&self, _context: ContextHandle) -> Result<u64, TraceError> {
        Ok(self.state().clock)
    }

    fn dropped_record_count(&self, _context: ContextHandle, _stream: u32) -> Result<usize, TraceError> {
        Ok(0)
    }

    fn subscribe(&self) -> Result<(), TraceError> {
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), TraceError> {
        Ok(())
    }

    fn finalize(&self) -> Result<(), TraceError> {
        Ok(())
    }
}

/// What the tool collects from drained buffers.
#[derive(Default)]
struct Collected {
    attribution: external::Attribution,
    kernels: Vec<(Option<u64>, AbstractRecord)>,
}

fn handle_kernel(record: &RecordRef<'_>, collected: &mut Collected) {
    match Record::decode(record) {
        Ok(record) => {
            let host_operation = collected.attribution.host_operation_of(&record);
            collected.kernels.push((host_operation, AbstractRecord::from(&record)));
        }
        Err(e) => tracing::warn!("undecodable kernel record: {e}"),
    }
}

fn handle_external(record: &RecordRef<'_>, collected: &mut Collected) {
    if let Ok(Record::ExternalCorrelation(record)) = Record::decode(record) {
        collected.attribution.observe(&record);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .init();

    let device = Arc::new(SimulatedDevice::default());
    let session = Session::builder(Arc::clone(&device) as Arc<dyn DeviceClient>)
        .with_buffer_size(4096)
        .with_dropped_handler(|dropped| eprintln!("{dropped} records dropped"))
        .with_module_hook(|event, id, image| {
            println!("module {id} {event:?} ({} bytes)", image.len())
        })
        .build()?;

    let table = Arc::new(
        DispatchTable::new()
            .with_kinds([Kind::Kernel, Kind::ConcurrentKernel], handle_kernel)
            .with_handler(Kind::ExternalCorrelation, handle_external)
            .with_unknown_handler(|record, _: &mut Collected| {
                println!("skipping {:?} record", record.record_type())
            }),
    );
    let collected = Arc::new(Mutex::new(Collected::default()));

    let mut tracer = session.register_device(0, 0, CONTEXT);
    let sink = Arc::clone(&collected);
    tracer.start_trace(move |records: activity::DeviceRecords<'_>| {
        let mut collected = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let summary = table.drain(records.bytes(), &mut collected);
        println!(
            "device {} context {}: {} dispatched, {} unknown",
            records.device_id, records.context_id, summary.dispatched, summary.unknown
        );
    });
    let status = tracer.set_trace_native(NativeCategories::KERNEL_INVOCATION.bits(), true);
    println!("native kernel tracing: {status:?}");
    session.notify_module(ModuleEvent::Load, 1, &[0u8; 16]);

    // Two target operations, each launching one kernel.
    let mut interceptor = session.interceptor();
    let mut host = session.host_operations();
    for _ in 0..2 {
        host.begin_operation();
        interceptor.on_api(ApiSite::Enter, ApiFunction::LaunchKernel, &mut host);
        device.launch();
        interceptor.on_api(ApiSite::Exit, ApiFunction::LaunchKernel, &mut host);
        host.end_operation();
    }

    // Kernels are disabled while paused, so this launch leaves no record.
    tracer.pause_trace(true);
    device.launch();
    tracer.pause_trace(false);
    device.launch();
    println!("device time: {:?}", tracer.get_device_time());
    tracer.flush_trace();
    tracer.stop_trace();

    let collected = collected.lock().unwrap_or_else(PoisonError::into_inner);
    for (host_operation, record) in &collected.kernels {
        println!(
            "{} {:?}..{:?} host operation {host_operation:?}",
            record.record_type.map_or("NONE", |t| t.as_str()),
            record.start_time,
            record.end_time,
        );
    }
    Ok(())
}
