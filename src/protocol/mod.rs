//! Wire protocol: framing, envelopes and the command contract.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Shape |
//! |---------|-----------|-------|
//! | Greeting | Remote → Local | one frame, discarded |
//! | Command | Local → Remote | `[0, serial, name, params]` |
//! | Response | Remote → Local | `[1, serial, error, data]` |
//!
//! Every message travels as one `<length>:<json>` frame.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Length-prefixed framing codec |
//! | `message` | Command and response envelopes |
//! | `command` | [`Command`] trait and built-in catalog |
//! | `decode` | Result shape decoders |

// ============================================================================
// Submodules
// ============================================================================

/// Command contract and catalog.
pub mod command;

/// Result shape decoders.
pub mod decode;

/// Length-prefixed framing.
pub mod frame;

/// Command and response envelopes.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{
    CloseWindow, Command, ContextMode, ExecuteScript, FindElement, FindElements, GetContext,
    GetCurrentUrl, GetTitle, GetWindowHandle, GetWindowHandles, Locator, Navigate, NewSession,
    NewWindow, RawCommand, SetContext, SwitchToWindow, WindowKind,
};
pub use frame::{FrameReader, encode_frame, write_frame};
pub use message::{CommandEnvelope, Reply, WireError};
