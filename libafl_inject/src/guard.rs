//! Checks that an intercepted call was made into the module that is supposed to export it.

use std::borrow::Cow;

use strum::{EnumCount, IntoEnumIterator};

use crate::{config::EngineConfig, function::Function, Error};

/// Pairs of functions and the modules expected to host them.
const FUNCMOD_TABLE: &[(Function, &str)] = &[
    (Function::ReadFile, "kernel32.dll"),
    (Function::ReadFile, "kernelbase.dll"),
    (Function::Recv, "ws2_32.dll"),
    (Function::WinHttpReadData, "winhttp.dll"),
    (Function::InternetReadFile, "wininet.dll"),
    (Function::WinHttpWebSocketReceive, "winhttp.dll"),
    (Function::RegQueryValueEx, "advapi32.dll"),
    (Function::RegQueryValueEx, "kernelbase.dll"),
    (Function::ReadEventLog, "advapi32.dll"),
    (Function::Fread, "ucrtbase.dll"),
    (Function::Fread, "ucrtbased.dll"),
    (Function::Fread, "msvcrt.dll"),
    (Function::FreadS, "ucrtbase.dll"),
    (Function::FreadS, "ucrtbased.dll"),
    (Function::FreadS, "msvcrt.dll"),
    (Function::Read, "ucrtbase.dll"),
    (Function::Read, "ucrtbased.dll"),
    (Function::Read, "msvcrt.dll"),
    (Function::MapViewOfFile, "kernel32.dll"),
    (Function::MapViewOfFile, "kernelbase.dll"),
];

/// Knows which modules may host each [`Function`].
///
/// A call whose module is not on the list for its function did not come through the expected
/// export, so the engine never targets it.
#[derive(Debug, Clone)]
pub struct ModuleGuard {
    enabled: bool,
    expected: Vec<Vec<Cow<'static, str>>>,
}

impl Default for ModuleGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleGuard {
    /// A guard with the built-in function/module table.
    #[must_use]
    pub fn new() -> Self {
        let mut expected = vec![Vec::new(); Function::COUNT];
        for (function, module) in FUNCMOD_TABLE {
            expected[function.index()].push(Cow::Borrowed(*module));
        }
        Self {
            enabled: true,
            expected,
        }
    }

    /// A guard that lets every call through.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Builds the guard described by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self, Error> {
        let mut guard = if config.module_guard {
            Self::new()
        } else {
            Self::disabled()
        };
        for (function, module) in config.extra_modules()? {
            guard.allow(function, module.to_string());
        }
        Ok(guard)
    }

    /// Allows `module` to host `function`, in addition to the built-in table.
    pub fn allow<S>(&mut self, function: Function, module: S)
    where
        S: Into<Cow<'static, str>>,
    {
        self.expected[function.index()].push(module.into());
    }

    /// Whether this guard checks anything at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The modules allowed to host `function`.
    #[must_use]
    pub fn expected_modules(&self, function: Function) -> &[Cow<'static, str>] {
        &self.expected[function.index()]
    }

    /// `true` if `module` is one of the modules expected to host `function`.
    ///
    /// Module names are compared ASCII case-insensitively, ignoring any directory part.
    /// An unknown module never matches.
    #[must_use]
    pub fn function_is_in_expected_module(&self, function: Function, module: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(module) = module else {
            return false;
        };
        let module = module_basename(module);
        self.expected[function.index()]
            .iter()
            .any(|expected| expected.eq_ignore_ascii_case(module))
    }

    /// Functions without any expected module; calls to them can never be targeted.
    pub fn unguarded_functions(&self) -> impl Iterator<Item = Function> + '_ {
        Function::iter().filter(move |f| self.expected[f.index()].is_empty())
    }
}

fn module_basename(module: &str) -> &str {
    module
        .rsplit(|c: char| c == '\\' || c == '/')
        .next()
        .unwrap_or(module)
}
