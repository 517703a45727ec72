//! Error types for the Marionette client.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use marionette_client::{Result, protocol::GetTitle};
//!
//! async fn example(client: &Dispatcher) -> Result<()> {
//!     let title = client.execute(&GetTitle).await?;
//!     println!("{title}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Scope |
//! |----------|----------|-------|
//! | Driver | [`Error::Driver`] | issuing caller only, recoverable |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::ClientExiting`], [`Error::Terminated`] | whole connection |
//! | Decode | [`Error::Protocol`], [`Error::Json`] | whole connection |
//! | Validation | [`Error::InvalidArgument`] | local, nothing sent |
//! | Setup | [`Error::Config`], [`Error::TabNotFound`] | local |
//!
//! Anything other than a driver error means the connection is no longer
//! usable: reconnect rather than retry.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// DriverErrorKind
// ============================================================================

/// Closed set of error kinds the remote end reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// Shadow root is no longer attached to the document.
    DetachedShadowRoot,
    /// Another element would receive the click.
    ElementClickIntercepted,
    /// Element is not exposed to the accessibility tree.
    ElementNotAccessible,
    /// Element cannot be interacted with.
    ElementNotInteractable,
    /// Navigation hit an untrusted TLS certificate.
    InsecureCertificate,
    /// Command parameters were rejected.
    InvalidArgument,
    /// Cookie domain does not match the current page.
    InvalidCookieDomain,
    /// Element is in a state that forbids the command.
    InvalidElementState,
    /// Locator expression is malformed.
    InvalidSelector,
    /// Session does not exist or has ended.
    InvalidSessionId,
    /// Script threw an exception.
    JavascriptError,
    /// Pointer target lies outside the viewport.
    MoveTargetOutOfBounds,
    /// No user prompt is open.
    NoSuchAlert,
    /// No cookie matches the name.
    NoSuchCookie,
    /// No element matches the locator.
    NoSuchElement,
    /// Frame does not exist.
    NoSuchFrame,
    /// Element has no shadow root.
    NoSuchShadowRoot,
    /// Window handle does not exist.
    NoSuchWindow,
    /// Script did not finish within the script timeout.
    ScriptTimeout,
    /// Session could not be started.
    SessionNotCreated,
    /// Element reference no longer points into the document.
    StaleElementReference,
    /// Operation did not finish in time.
    Timeout,
    /// Screenshot could not be taken.
    UnableToCaptureScreen,
    /// Cookie could not be stored.
    UnableToSetCookie,
    /// A user prompt blocked the command.
    UnexpectedAlertOpen,
    /// Remote end does not implement the command.
    UnknownCommand,
    /// Unclassified failure, including unrecognised codes.
    UnknownError,
    /// Command is known but unsupported here.
    UnsupportedOperation,
}

impl DriverErrorKind {
    const TABLE: &'static [(Self, &'static str)] = &[
        (Self::DetachedShadowRoot, "detached shadow root"),
        (Self::ElementClickIntercepted, "element click intercepted"),
        (Self::ElementNotAccessible, "element not accessible"),
        (Self::ElementNotInteractable, "element not interactable"),
        (Self::InsecureCertificate, "insecure certificate"),
        (Self::InvalidArgument, "invalid argument"),
        (Self::InvalidCookieDomain, "invalid cookie domain"),
        (Self::InvalidElementState, "invalid element state"),
        (Self::InvalidSelector, "invalid selector"),
        (Self::InvalidSessionId, "invalid session id"),
        (Self::JavascriptError, "javascript error"),
        (Self::MoveTargetOutOfBounds, "move target out of bounds"),
        (Self::NoSuchAlert, "no such alert"),
        (Self::NoSuchCookie, "no such cookie"),
        (Self::NoSuchElement, "no such element"),
        (Self::NoSuchFrame, "no such frame"),
        (Self::NoSuchShadowRoot, "no such shadow root"),
        (Self::NoSuchWindow, "no such window"),
        (Self::ScriptTimeout, "script timeout"),
        (Self::SessionNotCreated, "session not created"),
        (Self::StaleElementReference, "stale element reference"),
        (Self::Timeout, "timeout"),
        (Self::UnableToCaptureScreen, "unable to capture screen"),
        (Self::UnableToSetCookie, "unable to set cookie"),
        (Self::UnexpectedAlertOpen, "unexpected alert open"),
        (Self::UnknownCommand, "unknown command"),
        (Self::UnknownError, "unknown error"),
        (Self::UnsupportedOperation, "unsupported operation"),
    ];

    /// Parses a wire error code.
    ///
    /// Codes outside the known set map to [`DriverErrorKind::UnknownError`].
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        Self::TABLE
            .iter()
            .find(|(_, name)| *name == code)
            .map_or(Self::UnknownError, |(kind, _)| *kind)
    }

    /// Returns the wire error code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or("unknown error", |(_, name)| name)
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DriverError
// ============================================================================

/// Structured error reported by the remote end for a single command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DriverError {
    /// Named error kind.
    pub kind: DriverErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Remote stack trace, possibly empty.
    pub stacktrace: String,
}

impl DriverError {
    /// Creates a driver error without a stack trace.
    #[must_use]
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stacktrace: String::new(),
        }
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Driver Errors
    // ========================================================================
    /// Remote semantic failure for one command.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// I/O failure while reading or writing the stream.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Operation attempted on a connection that was already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Synthetic error delivered to pending calls on shutdown.
    #[error("Client exiting")]
    ClientExiting,

    /// The receive loop stopped because of the wrapped error.
    #[error("Connection terminated: {0}")]
    Terminated(Arc<Error>),

    // ========================================================================
    // Decode Errors
    // ========================================================================
    /// Frame, envelope or result shape could not be decoded.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// Command failed its client-side check; nothing was sent.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Setup Errors
    // ========================================================================
    /// Client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// No tab is registered under this name.
    #[error("Tab not found: {name}")]
    TabNotFound {
        /// The unknown tab name.
        name: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a tab not found error.
    #[inline]
    pub fn tab_not_found(name: impl Into<String>) -> Self {
        Self::TabNotFound { name: name.into() }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns the driver error kind, if this is a driver error.
    #[inline]
    #[must_use]
    pub fn driver_kind(&self) -> Option<DriverErrorKind> {
        match self {
            Self::Driver(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Returns `true` if this is a remote driver error.
    #[inline]
    #[must_use]
    pub fn is_driver_error(&self) -> bool {
        matches!(self, Self::Driver(_))
    }

    /// Returns `true` if this error means the connection is gone.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::ClientExiting
                | Self::Terminated(_)
        )
    }

    /// Returns `true` if retrying on the same connection may succeed.
    ///
    /// Only driver errors and local validation failures leave the
    /// connection usable.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Driver(_) | Self::InvalidArgument { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
