//! Arbitration of single-valued remote state.
//!
//! The remote end has one active window and one execution context. These
//! managers let many callers share them safely:
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TabManager`] | Named tabs over the single active window |
//! | [`Tab`] | Thin handle running commands in one tab |
//! | [`ContextManager`] | Chrome/content context gate |
//!
//! # Example
//!
//! ```no_run
//! use marionette_client::{ClientOptions, ContextManager, ContextMode, Dispatcher, GetTitle, Result, TabManager};
//!
//! # async fn example() -> Result<()> {
//! let client = Dispatcher::connect(&ClientOptions::new()).await?;
//!
//! let tabs = TabManager::new(client.clone(), ["search", "results"]).await?;
//! let search = tabs.tab("search")?;
//! search.navigate("https://example.com").await?;
//!
//! let contexts = ContextManager::new(client);
//! let title = contexts.execute(ContextMode::Content, &GetTitle).await?;
//! # let _ = title;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Chrome/content context gate.
pub mod context;

/// Tab/window lock manager.
pub mod tab;

// ============================================================================
// Re-exports
// ============================================================================

pub use context::{ContextGuard, ContextManager};
pub use tab::{Tab, TabLease, TabLeaseError, TabManager};
