//! Engine configuration, built in code or parsed from a toml file.

use std::{fs, path::Path};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{function::Function, Error, MAX_BUFFER_PREFIX, SUB_ASLR_BITS};

/// What to do with a descriptor whose `functionName` names no known function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFunctionPolicy {
    /// Fail the whole load, keeping the previous registry.
    #[default]
    RejectLoad,
    /// Drop the offending descriptor and load the rest.
    SkipDescriptor,
}

/// How a descriptor `mode` with several technique bits is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechniquePolicy {
    /// Accept it; every technique must hold for a match.
    #[default]
    Conjunction,
    /// Reject it at load time.
    Single,
}

/// Configuration of a [`crate::MatchEngine`].
///
/// ```toml
/// aslr_mask = 0xffff
/// unknown_function = "skip_descriptor"
///
/// [extra_modules]
/// fread = ["msvcr120.dll"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bits of the module-relative return address compared across runs
    #[builder(default = SUB_ASLR_BITS)]
    pub aslr_mask: u64,
    /// Policy for unresolvable function names
    #[builder(default)]
    pub unknown_function: UnknownFunctionPolicy,
    /// Policy for descriptors combining techniques
    #[builder(default)]
    pub techniques: TechniquePolicy,
    /// Check that calls come from the module expected to host the function
    #[builder(default = true)]
    pub module_guard: bool,
    /// Additional modules allowed to host a function, keyed by function name
    #[builder(default)]
    pub extra_modules: HashMap<String, Vec<String>>,
    /// Number of argument-buffer bytes kept and compared
    #[builder(default = MAX_BUFFER_PREFIX)]
    pub max_buffer_prefix: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EngineConfig {
    /// Parses a toml config.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a toml config file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text).map_err(|err| {
            let path = path.as_ref().to_string_lossy();
            Error::illegal_argument(format!("Failed to read config from {path}: {err}"))
        })
    }

    /// Resolves `extra_modules` to function identities.
    pub fn extra_modules(&self) -> Result<Vec<(Function, &str)>, Error> {
        let mut ret = Vec::new();
        for (name, modules) in &self.extra_modules {
            let function = name.parse::<Function>().map_err(|_| {
                Error::illegal_argument(format!("extra_modules names unknown function {name}"))
            })?;
            ret.extend(modules.iter().map(|module| (function, module.as_str())));
        }
        Ok(ret)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.aslr_mask == 0 {
            return Err(Error::illegal_argument("aslr_mask must keep at least one bit"));
        }
        self.extra_modules().map(|_| ())
    }
}
