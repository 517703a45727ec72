//! Marionette client - async browser automation over the Marionette protocol.
//!
//! This library drives a browser's Marionette server over a single
//! length-prefixed JSON stream, multiplexing any number of concurrent
//! callers onto it.
//!
//! # Architecture
//!
//! The client is layered:
//!
//! - **Framing**: `<length>:<json>` frames over any async byte stream
//! - **Connection**: owns the stream, assigns serials, runs the receive loop
//! - **Dispatcher**: routes each reply to the caller owning its serial
//! - **Managers**: arbitrate the single active window and execution context
//!
//! Key design principles:
//!
//! - Commands are typed values implementing [`Command`]
//! - Driver errors reach only the issuing caller
//! - Connection and decode failures are terminal and fail every pending call
//!
//! # Quick Start
//!
//! ```no_run
//! use marionette_client::{ClientOptions, Dispatcher, GetTitle, Navigate, NewSession, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Dispatcher::connect(&ClientOptions::new()).await?;
//!     client.execute(&NewSession::default()).await?;
//!
//!     client
//!         .execute(&Navigate {
//!             url: "https://example.com".to_string(),
//!         })
//!         .await?;
//!     let title = client.execute(&GetTitle).await?;
//!     println!("Page title: {title}");
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`browser`] | Tab and context managers |
//! | [`config`] | [`ClientOptions`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Framing, envelopes, command catalog |
//! | [`transport`] | Connection and dispatcher |

// ============================================================================
// Modules
// ============================================================================

/// Tab and context arbitration.
///
/// - [`TabManager`] - named tabs over the single active window
/// - [`ContextManager`] - chrome/content context gate
pub mod browser;

/// Client configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing serials, window handles and element
/// references.
pub mod identifiers;

/// Marionette wire protocol.
pub mod protocol;

/// Stream transport and response dispatch.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Managers
pub use browser::{ContextGuard, ContextManager, Tab, TabLease, TabLeaseError, TabManager};

// Configuration
pub use config::ClientOptions;

// Error types
pub use error::{DriverError, DriverErrorKind, Error, Result};

// Identifier types
pub use identifiers::{ElementId, Serial, WindowHandle};

// Commands
pub use protocol::{
    CloseWindow, Command, ContextMode, ExecuteScript, FindElement, FindElements, GetContext,
    GetCurrentUrl, GetTitle, GetWindowHandle, GetWindowHandles, Locator, Navigate, NewSession,
    NewWindow, RawCommand, SetContext, SwitchToWindow, WindowKind,
};

// Transport
pub use transport::{Connection, Dispatcher, LoopStatus, ResponseSlot};
