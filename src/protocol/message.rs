//! Command and response envelopes.
//!
//! # Format
//!
//! Outbound (client → server):
//! ```json
//! [0, 12, "WebDriver:Navigate", {"url": "https://example.com"}]
//! ```
//!
//! Inbound (server → client), success and failure:
//! ```json
//! [1, 12, null, {"value": null}]
//! [1, 12, {"error": "no such element", "message": "...", "stacktrace": "..."}, null]
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DriverError, DriverErrorKind, Error, Result};
use crate::identifiers::Serial;

// ============================================================================
// Constants
// ============================================================================

/// Type tag of a client command.
pub const COMMAND_TAG: u8 = 0;

/// Type tag of a server response.
pub const RESPONSE_TAG: u8 = 1;

// ============================================================================
// Outbound
// ============================================================================

/// Serialized form of one command: `[0, serial, name, params]`.
#[derive(Debug, Serialize)]
pub struct CommandEnvelope<'a>(u8, Serial, &'a str, &'a Value);

impl<'a> CommandEnvelope<'a> {
    /// Builds the envelope for `name` with `params` (`null` when absent).
    #[inline]
    #[must_use]
    pub fn new(serial: Serial, name: &'a str, params: &'a Value) -> Self {
        Self(COMMAND_TAG, serial, name, params)
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Error object as the server sends it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WireError {
    /// Error code, one of the named kinds.
    #[serde(default)]
    pub error: String,
    /// Free-text message.
    #[serde(default)]
    pub message: String,
    /// Remote stack trace.
    #[serde(default)]
    pub stacktrace: String,
}

impl From<WireError> for DriverError {
    fn from(wire: WireError) -> Self {
        Self {
            kind: DriverErrorKind::from_code(&wire.error),
            message: wire.message,
            stacktrace: wire.stacktrace,
        }
    }
}

/// Raw inbound envelope: `[tag, serial, error, data]`.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope(u8, u64, Option<WireError>, Value);

// ============================================================================
// Reply
// ============================================================================

/// One decoded response, routed to the caller that owns `serial`.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Serial echoed by the server.
    pub serial: Serial,
    /// Result payload (`null` on failure).
    pub data: Value,
    /// Driver error, if the command failed remotely.
    pub error: Option<DriverError>,
}

impl Reply {
    /// Decodes a frame payload into a reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the payload is not a 4-element
    /// response envelope with tag `1` and a nonzero serial.
    pub fn from_frame(payload: &[u8]) -> Result<Self> {
        let ResponseEnvelope(tag, serial, error, data) = serde_json::from_slice(payload)
            .map_err(|e| Error::protocol(format!("malformed response envelope: {e}")))?;

        if tag != RESPONSE_TAG {
            return Err(Error::protocol(format!(
                "expected response tag {RESPONSE_TAG}, got {tag}"
            )));
        }

        let serial =
            Serial::new(serial).ok_or_else(|| Error::protocol("response carries serial 0"))?;

        Ok(Self {
            serial,
            data,
            error: error.map(DriverError::from),
        })
    }

    /// Returns the data, or the driver error if one was reported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Driver`] when the server reported a failure.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(Error::Driver(err)),
            None => Ok(self.data),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
