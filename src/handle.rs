//! Opaque 64-bit window handles.
//!
//! Handles cross the wire as `"0x"` + uppercase hex and are parsed
//! case-insensitively. Handle `0` is the none/desktop sentinel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// An opaque identifier of an OS window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowHandle(pub u64);

impl WindowHandle {
    /// Sentinel for "none/desktop".
    pub const NONE: WindowHandle = WindowHandle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Error returned when a handle string does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid window handle: {0:?}")]
pub struct ParseHandleError(pub String);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl FromStr for WindowHandle {
    type Err = ParseHandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseHandleError(s.to_string()))?;
        u64::from_str_radix(hex, 16)
            .map(WindowHandle)
            .map_err(|_| ParseHandleError(s.to_string()))
    }
}

impl From<u64> for WindowHandle {
    fn from(raw: u64) -> Self {
        WindowHandle(raw)
    }
}

impl Serialize for WindowHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WindowHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
