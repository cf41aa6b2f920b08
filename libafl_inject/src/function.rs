//! The closed set of data-reading functions the harness knows how to hook.

use serde::{Serialize, Serializer};
use strum_macros::{Display, EnumCount, EnumIter, EnumString, IntoStaticStr};

/// A function the hooking layer intercepts.
///
/// The string form is the exact exported name used in descriptor lists, so
/// `"_read".parse::<Function>()` yields [`Function::Read`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    IntoStaticStr,
    EnumIter,
    EnumCount,
)]
#[repr(u8)]
pub enum Function {
    /// `kernel32!ReadFile`
    ReadFile,
    /// `ws2_32!recv`
    #[strum(serialize = "recv")]
    Recv,
    /// `winhttp!WinHttpReadData`
    WinHttpReadData,
    /// `wininet!InternetReadFile`
    InternetReadFile,
    /// `winhttp!WinHttpWebSocketReceive`
    WinHttpWebSocketReceive,
    /// `advapi32!RegQueryValueEx`
    RegQueryValueEx,
    /// `advapi32!ReadEventLog`
    ReadEventLog,
    /// CRT `fread`
    #[strum(serialize = "fread")]
    Fread,
    /// CRT `fread_s`
    #[strum(serialize = "fread_s")]
    FreadS,
    /// CRT `_read`
    #[strum(serialize = "_read")]
    Read,
    /// `kernel32!MapViewOfFile`
    MapViewOfFile,
}

impl Function {
    /// Dense index of this function, in `0..Function::COUNT`.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The exported name of this function.
    #[inline]
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Serialized as its exported name.
impl Serialize for Function {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.name())
    }
}
