//! Stream transport and response dispatch.
//!
//! # Architecture
//!
//! ```text
//! caller ──► Dispatcher::send ──► Connection::send ──► stream (write)
//!                                                          │
//! caller ◄── ResponseSlot ◄── dispatch task ◄── receive loop (read)
//! ```
//!
//! One receive loop and one dispatch task run per connection. Any number
//! of callers may send concurrently.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Stream ownership, serials, receive loop |
//! | `dispatcher` | Pending table and reply routing |

// ============================================================================
// Submodules
// ============================================================================

/// Stream connection and receive loop.
pub mod connection;

/// Serial-to-caller response correlation.
pub mod dispatcher;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, LoopStatus, ReplyReceiver};
pub use dispatcher::{Dispatcher, ResponseSlot};
