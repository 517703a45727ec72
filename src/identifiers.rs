//! Type-safe identifier wrappers.
//!
//! Newtypes keep wire serials, window handles and element references from
//! being mixed up at compile time.
//!
//! | Type | Wire form | Assigned by |
//! |------|-----------|-------------|
//! | [`Serial`] | unsigned integer | client, per connection |
//! | [`WindowHandle`] | opaque string | server |
//! | [`ElementId`] | opaque string (UUID) | server |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

// ============================================================================
// Serial
// ============================================================================

/// Per-connection command serial.
///
/// Serials start at 1 and increase monotonically for the lifetime of a
/// connection. Zero is never a valid serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(NonZeroU64);

impl Serial {
    /// The first serial assigned on a fresh connection.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Creates a serial from a raw value.
    ///
    /// Returns `None` for zero.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Option<Self> {
        match NonZeroU64::new(value) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Returns the serial that follows this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// WindowHandle
// ============================================================================

/// Opaque server-assigned handle for a top-level browsing context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(String);

impl WindowHandle {
    /// Wraps a raw handle string.
    #[inline]
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Returns the handle as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ElementId
// ============================================================================

/// Server-side reference to a DOM element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    /// Wraps a raw element reference.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the reference as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
