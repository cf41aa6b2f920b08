/*!
`libafl_inject` is the targeting core of a fault-injection harness.

The hooking layer intercepts calls to data-reading functions (`ReadFile`, `recv`, `fread`, ...)
inside the monitored program and hands every call to a [`MatchEngine`]. The engine counts the call,
checks it against the loaded [`TargetDescriptor`]s and answers one question: is *this* occurrence
the one the operator asked to corrupt? What to corrupt is up to the caller.
*/
#![doc = include_str!("../README.md")]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    //unused_results
)]

pub mod config;
pub mod descriptor;
pub mod diagnostics;
pub mod engine;
pub mod function;
pub mod guard;
pub mod hasher;
pub mod registry;
pub mod tracker;

use core::fmt;
use std::io;

pub use config::{EngineConfig, TechniquePolicy, UnknownFunctionPolicy};
pub use descriptor::{BoundedPath, Precision, TargetDescriptor, Techniques};
pub use engine::{CallInfo, Decision, DescriptorId, DescriptorState, MatchEngine};
pub use function::Function;
pub use guard::ModuleGuard;
pub use hasher::{arg_digest, hash_args, HashContext};
pub use registry::TargetRegistry;
pub use tracker::CallTracker;

/// Bits of a return address that ASLR leaves untouched.
pub const SUB_ASLR_BITS: u64 = 0xffff;

/// Maximum length of a filename, in UTF-16 code units, as on Windows.
pub const MAX_PATH: usize = 260;

/// Default number of argument-buffer bytes kept in a descriptor.
pub const MAX_BUFFER_PREFIX: usize = 256;

/// Main error struct for `libafl_inject`
#[derive(Debug)]
pub enum Error {
    /// Serialization error
    Serialize(String),
    /// File related error
    File(io::Error),
    /// Key not in Map
    KeyNotFound(String),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// Serialization error
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into())
    }
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg)
    }
    /// Key not in Map
    #[must_use]
    pub fn key_not_found<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::KeyNotFound(arg.into())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Serialize(s) => write!(f, "Error in Serialization: `{0}`", &s),
            Self::File(err) => write!(f, "File IO failed: {:?}", &err),
            Self::KeyNotFound(s) => write!(f, "Key `{0}` not found", &s),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {0}", &s),
            Self::Unknown(s) => write!(f, "Unknown error: {0}", &s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(err) => Some(err),
            _ => None,
        }
    }
}

/// Stringify the json serializer error
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

/// Stringify the toml deserializer error
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::serialize(format!("{err}"))
    }
}

/// Create an inject Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn test_error_display() {
        let err = Error::illegal_argument("mode 0 has no technique");
        assert_eq!(format!("{err}"), "Illegal argument: mode 0 has no technique");

        let err: Error = serde_json::from_str::<u64>("\"x\"").unwrap_err().into();
        assert!(matches!(err, Error::Serialize(_)));
    }
}
