//! Host-side correlation: operation ids and the external correlation stack.
//!
//! When a worker enters a correlated device API function, the id of the host operation
//! it is performing is pushed onto the device client's external correlation stack, and
//! popped again when the function exits. The producer tags every record created in
//! between with that id, which is how device records get attributed to host operations.
use std::{
    collections::HashSet,
    num::NonZero,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{
    client::DeviceClient,
    error::{ErrorChannel, TraceError},
};

/// A host correlation id. Zero is reserved for "no id" and cannot be represented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct CorrelationId(NonZero<u64>);

impl CorrelationId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZero::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Thread-safe dispenser of increasing ids starting at 1.
#[derive(Debug)]
struct Ticket(AtomicU64);

impl Default for Ticket {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl Ticket {
    fn next(&self) -> CorrelationId {
        loop {
            if let Some(id) = CorrelationId::new(self.0.fetch_add(1, Ordering::Relaxed)) {
                return id;
            }
        }
    }
}

/// Process-wide tickets for target region and target operation ids.
#[derive(Debug, Default)]
pub struct OperationTickets {
    region: Ticket,
    operation: Ticket,
}

impl OperationTickets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// The host operations a worker is currently inside of.
#[derive(Debug)]
pub struct HostOperations {
    tickets: Arc<OperationTickets>,
    region: Option<CorrelationId>,
    operation: Option<CorrelationId>,
}

impl HostOperations {
    pub fn new(tickets: Arc<OperationTickets>) -> Self {
        Self {
            tickets,
            region: None,
            operation: None,
        }
    }

    /// Enter a target region and return its fresh id.
    pub fn target_region_begin(&mut self) -> CorrelationId {
        let id = self.tickets.region.next();
        self.region = Some(id);
        id
    }

    /// Leave the current target region, returning its id.
    pub fn target_region_end(&mut self) -> Option<CorrelationId> {
        self.region.take()
    }

    /// Start a target operation (data transfer or kernel submission) and return its id.
    pub fn begin_operation(&mut self) -> CorrelationId {
        let id = self.tickets.operation.next();
        self.operation = Some(id);
        id
    }

    pub fn end_operation(&mut self) -> Option<CorrelationId> {
        self.operation.take()
    }

    pub fn region(&self) -> Option<CorrelationId> {
        self.region
    }

    pub fn operation(&self) -> Option<CorrelationId> {
        self.operation
    }
}

/// Supplies the host correlation id of the operation being performed, if any.
pub trait CorrelationSource {
    fn correlation_id(&mut self) -> Option<CorrelationId>;
}

impl CorrelationSource for HostOperations {
    fn correlation_id(&mut self) -> Option<CorrelationId> {
        self.operation
    }
}

/// A caller-supplied id generator. A zero from the generator means "no id".
#[derive(Debug)]
pub struct Generator<F>(pub F);

impl<F> CorrelationSource for Generator<F>
where
    F: FnMut() -> u64,
{
    fn correlation_id(&mut self) -> Option<CorrelationId> {
        CorrelationId::new((self.0)())
    }
}

/// Process-wide unique ids whose top 16 bits name the issuing worker.
#[derive(Debug, Default)]
pub struct UniqueIds {
    workers: AtomicU64,
}

const WORKER_BITS: u32 = 16;

impl UniqueIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator for one worker.
    pub fn generator(&self) -> UniqueIdGenerator {
        let worker = self.workers.fetch_add(1, Ordering::Relaxed) + 1;
        UniqueIdGenerator {
            prefix: worker << (u64::BITS - WORKER_BITS),
            next: 0,
        }
    }
}

/// Per-worker unique id generator, see [`UniqueIds`].
#[derive(Debug)]
pub struct UniqueIdGenerator {
    prefix: u64,
    next: u64,
}

impl UniqueIdGenerator {
    pub fn next_id(&mut self) -> u64 {
        self.next += 1;
        self.prefix | (self.next & ((1u64 << (u64::BITS - WORKER_BITS)) - 1))
    }
}

/// Device API entry points, as far as correlation cares about them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum ApiFunction {
    MemcpyHtoD,
    MemcpyDtoH,
    MemcpyDtoD,
    MemcpyHtoDAsync,
    MemcpyDtoHAsync,
    MemcpyDtoDAsync,
    MemcpyPeer,
    LaunchKernel,
    LaunchCooperativeKernel,
    StreamSynchronize,
    EventSynchronize,
    ContextSynchronize,
    MemAlloc,
    MemFree,
    ModuleLoad,
    ModuleUnload,
    /// Any other entry point, by callback id.
    Other(u32),
}

/// The entry points that create device records worth attributing by default.
pub const DEFAULT_CORRELATED: &[ApiFunction] = &[
    ApiFunction::MemcpyHtoD,
    ApiFunction::MemcpyDtoH,
    ApiFunction::MemcpyDtoD,
    ApiFunction::MemcpyHtoDAsync,
    ApiFunction::MemcpyDtoHAsync,
    ApiFunction::MemcpyDtoDAsync,
    ApiFunction::MemcpyPeer,
    ApiFunction::LaunchKernel,
    ApiFunction::LaunchCooperativeKernel,
    ApiFunction::StreamSynchronize,
    ApiFunction::EventSynchronize,
    ApiFunction::ContextSynchronize,
];

/// Allow-list of correlated entry points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationFilter {
    allowed: HashSet<ApiFunction>,
}

impl CorrelationFilter {
    pub fn new(allowed: impl IntoIterator<Item = ApiFunction>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn is_correlated(&self, function: ApiFunction) -> bool {
        self.allowed.contains(&function)
    }
}

impl Default for CorrelationFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATED.iter().copied())
    }
}

/// Site of an API callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum ApiSite {
    Enter,
    Exit,
}

/// One worker's mirror of its external correlation stack.
///
/// Push and pop must be issued by the same worker, so each worker owns one of these.
#[derive(Debug, Default)]
pub struct CorrelationStack {
    pushed: Vec<CorrelationId>,
}

impl CorrelationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle an API callback: push at entry, pop at exit.
    ///
    /// Nothing happens for functions outside `filter` or when there is no id. A pop
    /// without a matching push is ignored. Client failures go to `errors`.
    pub fn attribute(
        &mut self,
        client: &dyn DeviceClient,
        errors: &ErrorChannel,
        filter: &CorrelationFilter,
        site: ApiSite,
        function: ApiFunction,
        id: Option<CorrelationId>,
    ) {
        let Some(id) = id else { return };
        if !filter.is_correlated(function) {
            return;
        }
        match site {
            ApiSite::Enter => {
                trace!("push correlation {} for {function:?}", id.get());
                if errors
                    .check(
                        "push_external_correlation",
                        client.push_external_correlation(id),
                    )
                    .is_some()
                {
                    self.pushed.push(id);
                }
            }
            ApiSite::Exit => {
                if self.pushed.pop().is_none() {
                    warn!("correlation exit for {function:?} without entry");
                    return;
                }
                trace!("pop correlation {} for {function:?}", id.get());
                let popped =
                    errors.check("pop_external_correlation", client.pop_external_correlation());
                if let Some(popped) = popped.filter(|popped| *popped != id.get()) {
                    errors.report(
                        "pop_external_correlation",
                        &TraceError::client(
                            "pop_external_correlation",
                            format!("popped {popped}, expected {}", id.get()),
                        ),
                    );
                }
            }
        }
    }

    /// Number of ids this worker has pushed and not yet popped.
    pub fn depth(&self) -> usize {
        self.pushed.len()
    }
}

/// Per-worker API callback handler: a correlation stack bound to a session's client.
pub struct Interceptor {
    client: Arc<dyn DeviceClient>,
    errors: ErrorChannel,
    filter: Arc<CorrelationFilter>,
    stack: CorrelationStack,
}

impl Interceptor {
    pub(crate) fn new(
        client: Arc<dyn DeviceClient>,
        errors: ErrorChannel,
        filter: Arc<CorrelationFilter>,
    ) -> Self {
        Self {
            client,
            errors,
            filter,
            stack: CorrelationStack::new(),
        }
    }

    /// Called by the device client at entry and exit of `function`.
    pub fn on_api(
        &mut self,
        site: ApiSite,
        function: ApiFunction,
        source: &mut dyn CorrelationSource,
    ) {
        let id = source.correlation_id();
        self.stack.attribute(
            self.client.as_ref(),
            &self.errors,
            &self.filter,
            site,
            function,
            id,
        );
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::test::{Call, MockClient},
        error::test::collecting_channel,
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn id(raw: u64) -> Option<CorrelationId> {
        CorrelationId::new(raw)
    }

    #[test]
    fn zero_is_not_an_id() {
        assert_eq!(CorrelationId::new(0), None);
        assert_eq!(id(5).map(CorrelationId::get), Some(5));
    }

    #[test]
    fn push_pop_balance() {
        let client = MockClient::new();
        let (errors, reports) = collecting_channel();
        let filter = CorrelationFilter::default();
        let mut stack = CorrelationStack::new();

        for op in 1..=3 {
            stack.attribute(&client, &errors, &filter, ApiSite::Enter, ApiFunction::LaunchKernel, id(op));
            assert_eq!(client.correlation_depth(), 1);
            stack.attribute(&client, &errors, &filter, ApiSite::Exit, ApiFunction::LaunchKernel, id(op));
            assert_eq!(client.correlation_depth(), 0);
        }
        assert_eq!(
            client.calls(),
            vec![Call::Push(1), Call::Pop, Call::Push(2), Call::Pop, Call::Push(3), Call::Pop]
        );
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn zero_id_is_ignored() {
        let client = MockClient::new();
        let (errors, _) = collecting_channel();
        let filter = CorrelationFilter::default();
        let mut stack = CorrelationStack::new();

        let none = Generator(|| 0u64).correlation_id();
        stack.attribute(&client, &errors, &filter, ApiSite::Enter, ApiFunction::MemcpyHtoD, none);
        stack.attribute(&client, &errors, &filter, ApiSite::Exit, ApiFunction::MemcpyHtoD, none);
        assert!(client.calls().is_empty());
    }

    #[test]
    fn uncorrelated_functions_are_ignored() {
        let client = MockClient::new();
        let (errors, _) = collecting_channel();
        let filter = CorrelationFilter::default();
        let mut stack = CorrelationStack::new();

        stack.attribute(&client, &errors, &filter, ApiSite::Enter, ApiFunction::MemAlloc, id(4));
        stack.attribute(&client, &errors, &filter, ApiSite::Enter, ApiFunction::Other(999), id(4));
        assert!(client.calls().is_empty());

        let custom = CorrelationFilter::new([ApiFunction::MemAlloc]);
        stack.attribute(&client, &errors, &custom, ApiSite::Enter, ApiFunction::MemAlloc, id(4));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn failed_push_is_reported_and_not_mirrored() {
        let client = MockClient::new();
        client.fail_function("push_external_correlation");
        let (errors, reports) = collecting_channel();
        let filter = CorrelationFilter::default();
        let mut stack = CorrelationStack::new();

        stack.attribute(&client, &errors, &filter, ApiSite::Enter, ApiFunction::LaunchKernel, id(1));
        assert_eq!(stack.depth(), 0);
        stack.attribute(&client, &errors, &filter, ApiSite::Exit, ApiFunction::LaunchKernel, id(1));
        assert_eq!(client.count(|c| *c == Call::Pop), 0);
        assert_eq!(reports.lock().unwrap().len(), 1);
    }

    #[test]
    fn host_operations_drive_correlation() -> TestResult {
        let tickets = OperationTickets::new();
        let mut worker_a = HostOperations::new(Arc::clone(&tickets));
        let mut worker_b = HostOperations::new(tickets);

        let region = worker_a.target_region_begin();
        let op_a = worker_a.begin_operation();
        let op_b = worker_b.begin_operation();
        assert_ne!(op_a, op_b);
        assert_eq!(worker_a.correlation_id(), Some(op_a));

        assert_eq!(worker_a.end_operation(), Some(op_a));
        assert_eq!(worker_a.correlation_id(), None);
        assert_eq!(worker_a.target_region_end(), Some(region));
        assert_eq!(worker_a.region(), None);

        let client: Arc<dyn DeviceClient> = Arc::new(MockClient::new());
        let (errors, reports) = collecting_channel();
        let mut interceptor =
            Interceptor::new(client, errors, Arc::new(CorrelationFilter::default()));
        interceptor.on_api(ApiSite::Enter, ApiFunction::MemcpyDtoH, &mut worker_b);
        assert_eq!(interceptor.depth(), 1);
        interceptor.on_api(ApiSite::Exit, ApiFunction::MemcpyDtoH, &mut worker_b);
        assert_eq!(interceptor.depth(), 0);
        assert!(reports.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn unique_ids_carry_worker_prefix() {
        let ids = UniqueIds::new();
        let mut first = ids.generator();
        let mut second = ids.generator();
        assert_eq!(first.next_id(), (1u64 << 48) | 1);
        assert_eq!(first.next_id(), (1u64 << 48) | 2);
        assert_eq!(second.next_id(), (2u64 << 48) | 1);
    }
}
