//! Client connection options.
//!
//! # Example
//!
//! ```ignore
//! use marionette_client::ClientOptions;
//!
//! let options = ClientOptions::new()
//!     .with_address("127.0.0.1:2829")
//!     .with_max_frame_len(16 * 1024 * 1024);
//!
//! let client = Dispatcher::connect(&options).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Address Marionette listens on by default.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:2828";

/// Largest frame payload accepted by default (256 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

// ============================================================================
// ClientOptions
// ============================================================================

/// Connection configuration passed explicitly to constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// `host:port` of the remote end.
    pub address: String,

    /// Maximum declared frame length accepted from the remote end.
    pub max_frame_len: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientOptions {
    /// Sets the remote address.
    #[inline]
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets the maximum accepted frame length.
    #[inline]
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientOptions {
    /// Checks the options for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty address or a zero frame limit.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::config("address must not be empty"));
        }
        if self.max_frame_len == 0 {
            return Err(Error::config("max_frame_len must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
