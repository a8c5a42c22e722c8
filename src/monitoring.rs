//! Which record kinds are enabled, per device context.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    activity::Kind,
    client::{ContextHandle, DeviceClient},
    error::ErrorChannel,
};

/// Outcome of enabling or disabling a set of kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum SetStatus {
    /// Every kind in the set is now in the requested state.
    All,
    /// At least one kind reached the requested state and at least one failed.
    Some,
    /// No kind reached the requested state, including the case of an empty set.
    None,
}

impl SetStatus {
    fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (0, _) => SetStatus::None,
            (_, 0) => SetStatus::All,
            _ => SetStatus::Some,
        }
    }
}

/// A named, fixed list of record kinds.
///
/// The list may end with a [`Kind::Invalid`] sentinel; iteration stops at the first one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KindSet {
    name: &'static str,
    kinds: &'static [Kind],
}

impl KindSet {
    pub const fn new(name: &'static str, kinds: &'static [Kind]) -> Self {
        Self { name, kinds }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn iter(&self) -> impl Iterator<Item = Kind> + '_ {
        self.kinds.iter().copied().take_while(|kind| *kind != Kind::Invalid)
    }
}

pub const EXTERNAL_CORRELATION: KindSet =
    KindSet::new("external-correlation", &[Kind::ExternalCorrelation]);
pub const DATA_MOTION_EXPLICIT: KindSet = KindSet::new("data-motion-explicit", &[Kind::Memcpy]);
pub const DATA_MOTION_IMPLICIT: KindSet = KindSet::new(
    "data-motion-implicit",
    &[Kind::UnifiedMemoryCounter, Kind::Memcpy2],
);
pub const KERNEL_INVOCATION: KindSet = KindSet::new("kernel-invocation", &[Kind::Kernel]);
pub const KERNEL_EXECUTION: KindSet =
    KindSet::new("kernel-execution", &[Kind::PcSampling, Kind::Function]);
pub const OVERHEAD: KindSet = KindSet::new("overhead", &[Kind::Overhead]);
pub const DRIVER: KindSet = KindSet::new("driver", &[Kind::Driver]);
pub const RUNTIME: KindSet = KindSet::new("runtime", &[Kind::Runtime]);

bitflags! {
    /// Categories of native records a tool can ask for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct NativeCategories: u32 {
        const DATA_MOTION_EXPLICIT = 0x01;
        const DATA_MOTION_IMPLICIT = 0x02;
        const KERNEL_INVOCATION = 0x04;
        const KERNEL_EXECUTION = 0x08;
        const DRIVER = 0x10;
        const RUNTIME = 0x20;
        const OVERHEAD = 0x40;
    }
}

impl NativeCategories {
    /// The kind set bound to each category.
    const SETS: [(NativeCategories, KindSet); 7] = [
        (NativeCategories::DATA_MOTION_EXPLICIT, DATA_MOTION_EXPLICIT),
        (NativeCategories::DATA_MOTION_IMPLICIT, DATA_MOTION_IMPLICIT),
        (NativeCategories::KERNEL_INVOCATION, KERNEL_INVOCATION),
        (NativeCategories::KERNEL_EXECUTION, KERNEL_EXECUTION),
        (NativeCategories::DRIVER, DRIVER),
        (NativeCategories::RUNTIME, RUNTIME),
        (NativeCategories::OVERHEAD, OVERHEAD),
    ];
}

/// Outcome of [`MonitoringRegistry::set_trace_native`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum NativeTraceStatus {
    All,
    Some,
    None,
    /// No category was given, or the flags held unknown bits. Nothing was changed.
    Error,
}

type ContextKinds = BTreeMap<Kind, bool>;

/// Records, for each context, which kinds were enabled and disabled.
///
/// The registry is the source of truth for what a paused trace re-enables. Calls are
/// serialized by an internal lock that is held across the device client calls.
#[derive(Debug, Default)]
pub struct MonitoringRegistry {
    contexts: Mutex<HashMap<ContextHandle, ContextKinds>>,
}

impl MonitoringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<ContextHandle, ContextKinds>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enable or disable every kind of `set` in `context`.
    pub fn set_monitoring(
        &self,
        client: &dyn DeviceClient,
        errors: &ErrorChannel,
        context: ContextHandle,
        set: &KindSet,
        enable: bool,
    ) -> SetStatus {
        trace!(
            "{} {} in context {context:?}",
            if enable { "enable" } else { "disable" },
            set.name()
        );
        self.set_kinds(client, errors, context, set.iter(), enable)
    }

    /// Enable or disable each kind of `kinds` in `context`, stopping at a
    /// [`Kind::Invalid`] sentinel.
    ///
    /// A kind already recorded in the requested state counts as a success and is not
    /// passed to the device client. Kinds never enabled count as disabled.
    pub fn set_kinds(
        &self,
        client: &dyn DeviceClient,
        errors: &ErrorChannel,
        context: ContextHandle,
        kinds: impl IntoIterator<Item = Kind>,
        enable: bool,
    ) -> SetStatus {
        let mut contexts = self.contexts();
        let state = contexts.entry(context).or_default();
        let (mut succeeded, mut failed) = (0, 0);
        for kind in kinds.into_iter().take_while(|kind| *kind != Kind::Invalid) {
            if state.get(&kind).copied().unwrap_or(false) == enable {
                succeeded += 1;
                continue;
            }
            let result = if enable {
                errors.check("enable_kind", client.enable_kind(context, kind))
            } else {
                errors.check("disable_kind", client.disable_kind(context, kind))
            };
            match result {
                Some(()) => {
                    state.insert(kind, enable);
                    succeeded += 1;
                }
                None => failed += 1,
            }
        }
        let status = SetStatus::from_counts(succeeded, failed);
        debug!("set monitoring in context {context:?}: {status:?}");
        status
    }

    /// Enable or disable the kind sets of the given native categories, plus external
    /// correlation.
    ///
    /// Flags with bits outside [`NativeCategories`], or no bits at all, yield
    /// [`NativeTraceStatus::Error`] without touching the device client.
    pub fn set_trace_native(
        &self,
        client: &dyn DeviceClient,
        errors: &ErrorChannel,
        context: ContextHandle,
        flags: u32,
        enable: bool,
    ) -> NativeTraceStatus {
        let Some(categories) = NativeCategories::from_bits(flags) else {
            return NativeTraceStatus::Error;
        };
        if categories.is_empty() {
            return NativeTraceStatus::Error;
        }
        let (mut any_set, mut any_failed) = (false, false);
        for (category, set) in NativeCategories::SETS {
            if categories.contains(category) {
                match self.set_monitoring(client, errors, context, &set, enable) {
                    SetStatus::All => any_set = true,
                    SetStatus::Some => (any_set, any_failed) = (true, true),
                    SetStatus::None => any_failed = true,
                }
            }
        }
        self.set_monitoring(client, errors, context, &EXTERNAL_CORRELATION, true);
        match (any_set, any_failed) {
            (true, false) => NativeTraceStatus::All,
            (true, true) => NativeTraceStatus::Some,
            (false, _) => NativeTraceStatus::None,
        }
    }

    /// The kinds currently enabled in `context`, in kind order.
    pub fn enabled_kinds(&self, context: ContextHandle) -> Vec<Kind> {
        self.contexts()
            .get(&context)
            .map(|state| {
                state
                    .iter()
                    .filter(|(_, enabled)| **enabled)
                    .map(|(kind, _)| *kind)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, context: ContextHandle, kind: Kind) -> bool {
        self.contexts()
            .get(&context)
            .and_then(|state| state.get(&kind).copied())
            .unwrap_or(false)
    }

    /// Forget everything recorded for `context`.
    pub fn clear(&self, context: ContextHandle) {
        self.contexts().remove(&context);
    }
}
