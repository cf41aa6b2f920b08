//! The match engine: decides, call by call, whether to inject a fault.

use core::sync::atomic::{AtomicBool, Ordering};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use serde::Serialize;
use strum::IntoEnumIterator;

use crate::{
    config::EngineConfig,
    descriptor::{split_mode, BoundedPath, Precision, TargetDescriptor, Techniques},
    function::Function,
    guard::ModuleGuard,
    hasher::{arg_digest, HashContext},
    registry::TargetRegistry,
    tracker::CallTracker,
    Error,
};

/// What the hooking layer knows about one intercepted call.
///
/// The borrowed views are only valid while the hooked call runs; the engine never keeps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInfo<'a> {
    /// Which function was called
    pub function: Function,
    /// Position in the stream being read
    pub position: u64,
    /// Number of bytes the caller asked for
    pub requested_size: u64,
    /// Number of bytes actually read
    pub actual_size: u64,
    /// Item count argument (`fread` and friends), `0` otherwise
    pub count: u64,
    /// Return address relative to the module base of the caller
    pub ret_addr_offset: u64,
    /// Name of the module hosting the called function, if known
    pub module: Option<&'a str>,
    /// Address of the destination buffer in the monitored process
    pub buffer_address: u64,
    /// Name of the file being read, if the call has one
    pub source: Option<&'a [u16]>,
    /// The bytes read, or a prefix of them
    pub buffer: Option<&'a [u8]>,
}

impl<'a> CallInfo<'a> {
    /// A call to `function` with every other field zeroed or absent.
    #[must_use]
    pub fn new(function: Function) -> Self {
        Self {
            function,
            position: 0,
            requested_size: 0,
            actual_size: 0,
            count: 0,
            ret_addr_offset: 0,
            module: None,
            buffer_address: 0,
            source: None,
            buffer: None,
        }
    }

    /// The hashed part of this call.
    #[must_use]
    pub fn hash_context(&self) -> HashContext<'a> {
        HashContext {
            file_name: self.source.unwrap_or(&[]),
            count: self.count,
            position: self.position,
            read_size: self.requested_size,
        }
    }
}

/// Identifies a descriptor: its function and its position among that function's descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DescriptorId {
    /// The targeted function
    pub function: Function,
    /// Position in [`TargetRegistry::descriptors_for`]
    pub position: usize,
}

/// Where a descriptor stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DescriptorState {
    /// Loaded but not selected; it never matches.
    Disarmed,
    /// Selected and able to match.
    Armed,
    /// One-shot descriptor that already matched.
    Satisfied,
}

/// The outcome of evaluating one call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Decision {
    /// Whether this call is the one to corrupt
    pub targeted: bool,
    /// Occurrence index of this call among calls to its function
    pub occurrence: u64,
    /// Occurrence index of this call among calls at its normalized return address
    pub ret_addr_occurrence: u64,
    /// Argument digest of this call, `None` if the module guard rejected it
    pub arg_hash: Option<u128>,
    /// The descriptor that matched
    pub matched: Option<DescriptorId>,
    /// The call did not come from the expected module and was not considered
    pub module_mismatch: bool,
}

impl Decision {
    /// The argument digest as stored in `argHash`, empty if the call was not hashed.
    #[must_use]
    pub fn arg_hash_hex(&self) -> String {
        self.arg_hash
            .map(|digest| format!("{digest:032x}"))
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct MatchState {
    /// Set once a one-shot descriptor matched
    satisfied: AtomicBool,
    /// File latched by the first low precision match
    file: OnceLock<BoundedPath>,
    /// Buffer latched by the first medium precision match
    buffer: OnceLock<u64>,
}

/// A registry together with the match state of each of its descriptors.
/// Swapped as one unit, so a reload always starts from fresh state.
#[derive(Debug)]
struct Armed {
    registry: Arc<TargetRegistry>,
    states: Vec<Vec<MatchState>>,
}

impl Armed {
    fn new(registry: TargetRegistry) -> Self {
        let states = Function::iter()
            .map(|function| {
                registry
                    .descriptors_for(function)
                    .iter()
                    .map(|_| MatchState::default())
                    .collect()
            })
            .collect();
        Self {
            registry: Arc::new(registry),
            states,
        }
    }
}

/// The targeting context of one monitored process.
///
/// Created when the harness attaches, loaded with a descriptor list before hooks are armed,
/// then shared by every thread that hits a hook. Each call goes through [`MatchEngine::evaluate`],
/// which counts it and checks it against the loaded descriptors.
#[derive(Debug)]
pub struct MatchEngine {
    config: EngineConfig,
    guard: ModuleGuard,
    tracker: CallTracker,
    armed: RwLock<Arc<Armed>>,
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::with_guard(EngineConfig::default(), ModuleGuard::new())
    }
}

impl MatchEngine {
    /// Creates an engine with an empty registry.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        let guard = ModuleGuard::from_config(&config)?;
        Ok(Self::with_guard(config, guard))
    }

    /// Creates an engine with a custom module guard.
    #[must_use]
    pub fn with_guard(config: EngineConfig, guard: ModuleGuard) -> Self {
        Self {
            config,
            guard,
            tracker: CallTracker::new(),
            armed: RwLock::new(Arc::new(Armed::new(TargetRegistry::new()))),
        }
    }

    /// Loads a json descriptor list, replacing the current one.
    ///
    /// Returns `false` if the list is invalid, in which case the current registry stays active
    /// exactly as it was.
    pub fn load_targets(&self, text: &str) -> bool {
        match self.try_load_targets(text) {
            Ok(_) => true,
            Err(err) => {
                log::warn!("Keeping previous targets, failed to load new ones: {err}");
                false
            }
        }
    }

    /// Loads a json descriptor list, returning the number of loaded descriptors.
    pub fn try_load_targets(&self, text: &str) -> Result<usize, Error> {
        let registry = TargetRegistry::from_json(text, &self.config)?;
        let len = registry.len();
        self.install(registry)?;
        Ok(len)
    }

    /// Replaces the registry and resets all match state.
    ///
    /// Every descriptor's mode is checked against this engine's [`crate::TechniquePolicy`]
    /// first; on error the current registry stays active.
    pub fn install(&self, registry: TargetRegistry) -> Result<(), Error> {
        for desc in registry.iter() {
            split_mode(desc.mode(), self.config.techniques)?;
        }

        let selected = registry.iter().filter(|desc| desc.selected()).count();
        log::info!("Loaded {} targets, {selected} selected", registry.len());

        let armed = Arc::new(Armed::new(registry));
        *self.armed.write().unwrap_or_else(PoisonError::into_inner) = armed;
        Ok(())
    }

    fn armed(&self) -> Arc<Armed> {
        self.armed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The active registry.
    #[must_use]
    pub fn registry(&self) -> Arc<TargetRegistry> {
        self.armed().registry.clone()
    }

    /// The call counters.
    #[must_use]
    pub fn tracker(&self) -> &CallTracker {
        &self.tracker
    }

    /// The module guard.
    #[must_use]
    pub fn guard(&self) -> &ModuleGuard {
        &self.guard
    }

    /// The config this engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// `true` if this call should be corrupted.
    pub fn is_function_targeted(&self, call: &CallInfo) -> bool {
        self.evaluate(call).targeted
    }

    /// Counts `call` and checks it against every selected descriptor of its function.
    ///
    /// Never panics: a fault while evaluating is logged and reported as "not targeted".
    pub fn evaluate(&self, call: &CallInfo) -> Decision {
        panic::catch_unwind(AssertUnwindSafe(|| self.evaluate_call(call))).unwrap_or_else(|_| {
            log::error!("Evaluating a call to {} failed, not targeting it", call.function);
            Decision::default()
        })
    }

    fn evaluate_call(&self, call: &CallInfo) -> Decision {
        let occurrence = self.tracker.increment_call_count(call.function);
        let ret_addr = call.ret_addr_offset & self.config.aslr_mask;
        let ret_addr_occurrence = self.tracker.increment_retaddr_count(ret_addr);

        let mut decision = Decision {
            occurrence,
            ret_addr_occurrence,
            ..Decision::default()
        };

        if !self
            .guard
            .function_is_in_expected_module(call.function, call.module)
        {
            log::debug!(
                "{} #{occurrence} called through {:?}, not targeting it",
                call.function,
                call.module
            );
            decision.module_mismatch = true;
            return decision;
        }
        decision.arg_hash = Some(arg_digest(&call.hash_context()));

        let armed = self.armed();
        let descriptors = armed.registry.descriptors_for(call.function);
        let states = &armed.states[call.function.index()];

        for (position, (desc, state)) in descriptors.iter().zip(states).enumerate() {
            if !desc.selected() || state.satisfied.load(Ordering::Acquire) {
                continue;
            }
            if self.descriptor_matches(desc, state, call, &decision) {
                log::debug!(
                    "Targeting {} #{occurrence} (retaddr {ret_addr:#x} #{ret_addr_occurrence}, hash {})",
                    call.function,
                    decision.arg_hash_hex()
                );
                decision.targeted = true;
                decision.matched = Some(DescriptorId {
                    function: call.function,
                    position,
                });
                break;
            }
        }

        decision
    }

    fn descriptor_matches(
        &self,
        desc: &TargetDescriptor,
        state: &MatchState,
        call: &CallInfo,
        decision: &Decision,
    ) -> bool {
        // once latched, the whole file or buffer is the target
        match desc.precision() {
            Precision::Low => {
                if let (Some(file), Some(source)) = (state.file.get(), call.source) {
                    if file.matches_wide(source) {
                        return true;
                    }
                }
            }
            Precision::Medium => {
                if state.buffer.get() == Some(&call.buffer_address) {
                    return true;
                }
            }
            Precision::Any | Precision::High => {}
        }

        if !self.techniques_hold(desc, call, decision) {
            return false;
        }

        match desc.precision() {
            Precision::Any => true,
            Precision::Low => {
                if let Some(source) = call.source {
                    // a concurrent first match may have latched already, that one wins
                    let _ = state.file.set(BoundedPath::from_wide(source));
                }
                true
            }
            Precision::Medium => {
                // no destination address, nothing to latch
                if call.buffer_address != 0 {
                    let _ = state.buffer.set(call.buffer_address);
                }
                true
            }
            Precision::High => state
                .satisfied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    fn techniques_hold(&self, desc: &TargetDescriptor, call: &CallInfo, decision: &Decision) -> bool {
        let techniques = desc.techniques();
        let mask = self.config.aslr_mask;
        (!techniques.contains(Techniques::INDEX) || decision.occurrence == desc.index())
            && (!techniques.contains(Techniques::RETN_ADDRESS)
                || (call.ret_addr_offset & mask) == (desc.ret_addr_offset() & mask))
            && (!techniques.contains(Techniques::ARG_HASH)
                || desc
                    .arg_digest()
                    .is_some_and(|digest| decision.arg_hash == Some(digest)))
            && (!techniques.contains(Techniques::ARG_COMPARE)
                || call
                    .buffer
                    .is_some_and(|buffer| prefix_matches(desc.buffer(), buffer)))
            && (!techniques.contains(Techniques::FILENAMES)
                || call
                    .source
                    .is_some_and(|source| desc.source().matches_wide(source)))
            && (!techniques.contains(Techniques::RETN_COUNT)
                || decision.ret_addr_occurrence == desc.ret_addr_count())
    }

    /// The state of every loaded descriptor.
    #[must_use]
    pub fn descriptor_states(&self) -> Vec<(DescriptorId, DescriptorState)> {
        let armed = self.armed();
        let mut ret = Vec::with_capacity(armed.registry.len());
        for function in Function::iter() {
            let states = &armed.states[function.index()];
            let descriptors = armed.registry.descriptors_for(function);
            for (position, (desc, state)) in descriptors.iter().zip(states).enumerate() {
                let desc_state = if !desc.selected() {
                    DescriptorState::Disarmed
                } else if state.satisfied.load(Ordering::Acquire) {
                    DescriptorState::Satisfied
                } else {
                    DescriptorState::Armed
                };
                ret.push((DescriptorId { function, position }, desc_state));
            }
        }
        ret
    }

    /// Records a descriptor for an evaluated call, for a later run to load.
    ///
    /// Fails if `techniques` and `precision` do not form a mode this engine would load.
    pub fn record(
        &self,
        call: &CallInfo,
        decision: &Decision,
        techniques: Techniques,
        precision: Precision,
    ) -> Result<TargetDescriptor, Error> {
        TargetDescriptor::from_observed(
            call,
            decision,
            techniques,
            precision,
            self.config.techniques,
            self.config.aslr_mask,
            self.config.max_buffer_prefix,
        )
    }
}

/// Compares the common prefix of the stored bytes and the call's bytes.
#[inline]
fn prefix_matches(stored: &[u8], actual: &[u8]) -> bool {
    let len = stored.len().min(actual.len());
    stored[..len] == actual[..len]
}
