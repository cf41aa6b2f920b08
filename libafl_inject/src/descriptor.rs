//! Target descriptors: which occurrence of which function to corrupt, and how to recognize it.

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    config::TechniquePolicy,
    engine::{CallInfo, Decision},
    function::Function,
    Error, MAX_PATH,
};

/// Target a function by its index, e.g. the 5th `fread` call
pub const MATCH_INDEX: u64 = 1 << 0;
/// Target a function by its return address
pub const MATCH_RETN_ADDRESS: u64 = 1 << 1;
/// Target a function by a hash calculated from its arguments
pub const MATCH_ARG_HASH: u64 = 1 << 2;
/// Target a function by contents of argument buffer
pub const MATCH_ARG_COMPARE: u64 = 1 << 3;
/// Target a single file across multiple reads
pub const LOW_PRECISION: u64 = 1 << 4;
/// Target a single buffer across multiple reads
pub const MEDIUM_PRECISION: u64 = 1 << 5;
/// Target a single read from a single buffer
pub const HIGH_PRECISION: u64 = 1 << 6;
/// Target a byte-for-byte filename
pub const MATCH_FILENAMES: u64 = 1 << 7;
/// Target call counts by return address
pub const MATCH_RETN_COUNT: u64 = 1 << 8;

const PRECISION_MASK: u64 = LOW_PRECISION | MEDIUM_PRECISION | HIGH_PRECISION;

bitflags! {
    /// The matching techniques of a descriptor. All set techniques must hold for a call to match.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Techniques: u64 {
        /// Occurrence index of the function
        const INDEX = MATCH_INDEX;
        /// Module-relative return address, masked to the sub-ASLR bits
        const RETN_ADDRESS = MATCH_RETN_ADDRESS;
        /// Digest of the call arguments
        const ARG_HASH = MATCH_ARG_HASH;
        /// Prefix of the argument buffer
        const ARG_COMPARE = MATCH_ARG_COMPARE;
        /// Source filename
        const FILENAMES = MATCH_FILENAMES;
        /// Occurrence index at the return address
        const RETN_COUNT = MATCH_RETN_COUNT;
    }
}

/// Scopes what counts as the same event once a descriptor matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    /// Every call satisfying the techniques matches.
    #[default]
    Any,
    /// After the first match, every read against the same file matches.
    Low,
    /// After the first match, every read into the same buffer matches.
    Medium,
    /// One-shot: the first match is the only one.
    High,
}

impl Precision {
    /// The mode bit of this precision, `0` for [`Precision::Any`].
    #[must_use]
    pub const fn bits(self) -> u64 {
        match self {
            Precision::Any => 0,
            Precision::Low => LOW_PRECISION,
            Precision::Medium => MEDIUM_PRECISION,
            Precision::High => HIGH_PRECISION,
        }
    }
}

/// Splits a raw `mode` bitmask into its techniques and its precision.
pub fn split_mode(mode: u64, policy: TechniquePolicy) -> Result<(Techniques, Precision), Error> {
    let unknown = mode & !(Techniques::all().bits() | PRECISION_MASK);
    if unknown != 0 {
        return Err(Error::illegal_argument(format!(
            "mode {mode:#x} has unknown bits {unknown:#x}"
        )));
    }

    let techniques = Techniques::from_bits_truncate(mode);
    match techniques.bits().count_ones() {
        0 => {
            return Err(Error::illegal_argument(format!(
                "mode {mode:#x} has no matching technique"
            )))
        }
        1 => {}
        _ if policy == TechniquePolicy::Single => {
            return Err(Error::illegal_argument(format!(
                "mode {mode:#x} combines several matching techniques"
            )))
        }
        _ => {}
    }

    let precision = match mode & PRECISION_MASK {
        0 => Precision::Any,
        LOW_PRECISION => Precision::Low,
        MEDIUM_PRECISION => Precision::Medium,
        HIGH_PRECISION => Precision::High,
        _ => {
            return Err(Error::illegal_argument(format!(
                "mode {mode:#x} sets more than one precision"
            )))
        }
    };

    Ok((techniques, precision))
}

/// A filename bounded to [`MAX_PATH`] UTF-16 code units.
///
/// Longer names are truncated to their first [`MAX_PATH`] units, and a wide name stops at its
/// first NUL. Both the descriptor side and the call side go through the same truncation, so two
/// names that only differ past the bound compare equal.
///
/// On the wire a path is a json string. Windows names may hold unpaired surrogates, which a
/// string cannot carry: they are written as U+FFFD and such a path no longer matches after a
/// reload. [`TargetDescriptor::from_observed`] refuses to record one for filename matching.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BoundedPath {
    wide: Vec<u16>,
}

impl BoundedPath {
    /// Creates a bounded path from a rust string.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            wide: name.encode_utf16().take(MAX_PATH).collect(),
        }
    }

    /// Copies a bounded path out of a borrowed wide string.
    #[must_use]
    pub fn from_wide(wide: &[u16]) -> Self {
        Self {
            wide: Self::bound(wide).to_vec(),
        }
    }

    /// Cuts a wide string at its first NUL, then at [`MAX_PATH`] units.
    #[inline]
    #[must_use]
    pub fn bound(wide: &[u16]) -> &[u16] {
        let len = wide
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(wide.len())
            .min(MAX_PATH);
        &wide[..len]
    }

    /// The UTF-16 code units of this path.
    #[inline]
    #[must_use]
    pub fn as_wide(&self) -> &[u16] {
        &self.wide
    }

    /// Compares against a borrowed wide string, with the same bounds applied.
    #[inline]
    #[must_use]
    pub fn matches_wide(&self, wide: &[u16]) -> bool {
        self.wide == Self::bound(wide)
    }

    /// `true` if the path is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wide.is_empty()
    }

    /// `true` if the path is well-formed UTF-16 and survives serialization unchanged.
    #[must_use]
    pub fn is_unicode(&self) -> bool {
        char::decode_utf16(self.wide.iter().copied()).all(|c| c.is_ok())
    }
}

impl From<String> for BoundedPath {
    fn from(name: String) -> Self {
        Self::new(&name)
    }
}

impl From<BoundedPath> for String {
    fn from(path: BoundedPath) -> Self {
        String::from_utf16_lossy(&path.wide)
    }
}

impl fmt::Display for BoundedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf16_lossy(&self.wide))
    }
}

impl fmt::Debug for BoundedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundedPath({self})")
    }
}

/// One entry of a descriptor list, as found on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawDescriptor {
    pub(crate) selected: bool,
    pub(crate) index: u64,
    pub(crate) mode: u64,
    pub(crate) ret_addr_offset: u64,
    pub(crate) ret_addr_count: u64,
    pub(crate) function_name: String,
    #[serde(default)]
    pub(crate) arg_hash: String,
    #[serde(default)]
    pub(crate) source: BoundedPath,
    #[serde(default)]
    pub(crate) buffer: Vec<u8>,
}

/// Describes one monitored occurrence of one function.
///
/// Descriptors are validated when they are built and never change once they are part of a
/// [`crate::TargetRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "RawDescriptor")]
pub struct TargetDescriptor {
    selected: bool,
    index: u64,
    mode: u64,
    techniques: Techniques,
    precision: Precision,
    ret_addr_offset: u64,
    ret_addr_count: u64,
    function: Function,
    arg_hash: String,
    arg_digest: Option<u128>,
    source: BoundedPath,
    buffer: Vec<u8>,
}

impl TargetDescriptor {
    /// Validates a raw descriptor.
    ///
    /// An unknown function name is reported as [`Error::KeyNotFound`], every other problem as
    /// [`Error::IllegalArgument`].
    pub(crate) fn from_raw(
        raw: RawDescriptor,
        policy: TechniquePolicy,
        max_buffer_prefix: usize,
    ) -> Result<Self, Error> {
        let function = raw
            .function_name
            .parse::<Function>()
            .map_err(|_| Error::key_not_found(raw.function_name.clone()))?;
        let (techniques, precision) = split_mode(raw.mode, policy)?;

        if !raw.arg_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::illegal_argument(format!(
                "argHash `{}` of {function} is not hex",
                raw.arg_hash
            )));
        }
        if techniques.contains(Techniques::ARG_HASH) && raw.arg_hash.is_empty() {
            return Err(Error::illegal_argument(format!(
                "{function} targets by argument hash but has no argHash"
            )));
        }

        let arg_hash = raw.arg_hash.to_ascii_lowercase();
        // anything but a full digest never matches
        let arg_digest = if arg_hash.len() == 32 {
            u128::from_str_radix(&arg_hash, 16).ok()
        } else {
            None
        };

        let mut buffer = raw.buffer;
        buffer.truncate(max_buffer_prefix);

        Ok(Self {
            selected: raw.selected,
            index: raw.index,
            mode: raw.mode,
            techniques,
            precision,
            ret_addr_offset: raw.ret_addr_offset,
            ret_addr_count: raw.ret_addr_count,
            function,
            arg_hash,
            arg_digest,
            source: raw.source,
            buffer,
        })
    }

    /// Records a descriptor for a call the engine has just evaluated.
    ///
    /// This is how a tracing run produces the list a later fuzzing run loads: every field is
    /// filled from the observed call, so any technique can be picked afterwards. The returned
    /// descriptor is not selected.
    ///
    /// The mode is checked the same way a loaded list is, so whatever gets recorded loads again.
    /// Hash matching needs a call that passed the module guard, and filename matching needs a
    /// filename that is valid UTF-16.
    pub fn from_observed(
        call: &CallInfo,
        decision: &Decision,
        techniques: Techniques,
        precision: Precision,
        policy: TechniquePolicy,
        aslr_mask: u64,
        max_buffer_prefix: usize,
    ) -> Result<Self, Error> {
        let mode = techniques.bits() | precision.bits();
        split_mode(mode, policy)?;

        if techniques.contains(Techniques::ARG_HASH) && decision.arg_hash.is_none() {
            return Err(Error::illegal_argument(format!(
                "{} call #{} was not hashed, cannot target it by argument hash",
                call.function, decision.occurrence
            )));
        }
        let source = call.source.map(BoundedPath::from_wide).unwrap_or_default();
        if techniques.contains(Techniques::FILENAMES) && !source.is_unicode() {
            return Err(Error::illegal_argument(format!(
                "filename of {} call #{} is not valid UTF-16",
                call.function, decision.occurrence
            )));
        }

        let buffer = call
            .buffer
            .map(|b| b[..b.len().min(max_buffer_prefix)].to_vec())
            .unwrap_or_default();
        Ok(Self {
            selected: false,
            index: decision.occurrence,
            mode,
            techniques,
            precision,
            ret_addr_offset: call.ret_addr_offset & aslr_mask,
            ret_addr_count: decision.ret_addr_occurrence,
            function: call.function,
            arg_hash: decision.arg_hash_hex(),
            arg_digest: decision.arg_hash,
            source,
            buffer,
        })
    }

    /// Marks this descriptor as chosen (or not) for injection.
    pub fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }

    /// Whether the operator selected this descriptor.
    #[must_use]
    pub fn selected(&self) -> bool {
        self.selected
    }

    /// The intended occurrence index.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The raw mode bitmask.
    #[must_use]
    pub fn mode(&self) -> u64 {
        self.mode
    }

    /// The matching techniques.
    #[must_use]
    pub fn techniques(&self) -> Techniques {
        self.techniques
    }

    /// The precision qualifier.
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// The module-relative return address.
    #[must_use]
    pub fn ret_addr_offset(&self) -> u64 {
        self.ret_addr_offset
    }

    /// The intended occurrence index at the return address.
    #[must_use]
    pub fn ret_addr_count(&self) -> u64 {
        self.ret_addr_count
    }

    /// The function this descriptor targets.
    #[must_use]
    pub fn function(&self) -> Function {
        self.function
    }

    /// The lowercase hex argument hash, possibly empty.
    #[must_use]
    pub fn arg_hash(&self) -> &str {
        &self.arg_hash
    }

    /// The argument hash as a digest, if it is a full 32 digit one.
    #[must_use]
    pub fn arg_digest(&self) -> Option<u128> {
        self.arg_digest
    }

    /// The source filename, possibly empty.
    #[must_use]
    pub fn source(&self) -> &BoundedPath {
        &self.source
    }

    /// The argument buffer prefix, possibly empty.
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl From<TargetDescriptor> for RawDescriptor {
    fn from(desc: TargetDescriptor) -> Self {
        Self {
            selected: desc.selected,
            index: desc.index,
            mode: desc.mode,
            ret_addr_offset: desc.ret_addr_offset,
            ret_addr_count: desc.ret_addr_count,
            function_name: desc.function.name().to_string(),
            arg_hash: desc.arg_hash,
            source: desc.source,
            buffer: desc.buffer,
        }
    }
}
