//! Shared chrome/content context arbitration.
//!
//! The remote end runs commands in one of two mutually exclusive
//! [`ContextMode`]s. Any number of callers may run in the current mode at
//! once; a caller that wants the other mode waits until every holder of
//! the current mode has left, then switches.
//!
//! ```ignore
//! let contexts = ContextManager::new(client.clone());
//!
//! {
//!     let _chrome = contexts.enter(ContextMode::Chrome).await?;
//!     client.execute(&ExecuteScript::new("return Services.appinfo.name;")).await?;
//! } // leaves on drop
//!
//! let title = contexts.execute(ContextMode::Content, &GetTitle).await?;
//! ```
//!
//! Waiters are woken together and race for admission; there is no
//! queue, so a mode that keeps losing that race can starve. Code that
//! switches the remote context without going through the manager breaks
//! the tracked state.

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, trace};

use crate::error::Result;
use crate::protocol::{Command, ContextMode, GetContext, SetContext};
use crate::transport::Dispatcher;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Default)]
struct ContextState {
    /// Last known remote mode; `None` until first queried.
    mode: Option<ContextMode>,
    /// Callers currently inside `mode`.
    running: usize,
}

// ============================================================================
// ContextManager
// ============================================================================

/// Gates commands by execution context.
pub struct ContextManager {
    client: Dispatcher,
    state: Mutex<ContextState>,
    /// Serializes admission, including any switch in flight.
    gate: AsyncMutex<()>,
    changed: Notify,
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ContextManager")
            .field("mode", &state.mode)
            .field("running", &state.running)
            .finish_non_exhaustive()
    }
}

impl ContextManager {
    /// Creates a manager; the remote mode is queried on first use.
    #[must_use]
    pub fn new(client: Dispatcher) -> Self {
        Self {
            client,
            state: Mutex::new(ContextState::default()),
            gate: AsyncMutex::new(()),
            changed: Notify::new(),
        }
    }

    /// Enters `mode`, switching the remote context if nobody is running.
    ///
    /// Returns immediately when `mode` is already current. Otherwise waits
    /// until the running count drops to zero, then sends the switch.
    ///
    /// # Errors
    ///
    /// Returns the query or switch error; the tracked mode and running
    /// count are left as they were.
    pub async fn enter(&self, mode: ContextMode) -> Result<ContextGuard<'_>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a leave in between is seen
            notified.as_mut().enable();

            {
                let _gate = self.gate.lock().await;
                if self.try_admit(mode).await? {
                    return Ok(ContextGuard {
                        manager: self,
                        mode,
                    });
                }
            }

            trace!(%mode, "Waiting for context to drain");
            notified.await;
        }
    }

    /// Leaves the current mode and wakes all waiters.
    ///
    /// Only [`ContextGuard`]'s drop calls this, so `running` always equals
    /// the number of live guards.
    fn leave(&self) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.running > 0, "leave without a matching enter");
            state.running -= 1;
        }
        self.changed.notify_waiters();
    }

    /// Runs `cmd` inside `mode`.
    pub async fn execute<C: Command>(&self, mode: ContextMode, cmd: &C) -> Result<C::Output> {
        let _guard = self.enter(mode).await?;
        self.client.execute(cmd).await
    }

    /// Returns the tracked remote mode, if known.
    #[inline]
    #[must_use]
    pub fn current_mode(&self) -> Option<ContextMode> {
        self.state.lock().mode
    }

    /// Returns how many callers are inside the current mode.
    #[inline]
    #[must_use]
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Admits the caller if possible. Must be called with the gate held.
    async fn try_admit(&self, mode: ContextMode) -> Result<bool> {
        let known = {
            let mut state = self.state.lock();
            if state.mode == Some(mode) {
                state.running += 1;
                return Ok(true);
            }
            if state.running > 0 {
                return Ok(false);
            }
            state.mode
        };

        let current = match known {
            Some(current) => current,
            None => {
                let current = self.client.execute(&GetContext).await?;
                debug!(%current, "Queried remote context");
                self.state.lock().mode = Some(current);
                current
            }
        };

        if current != mode {
            self.client.execute(&SetContext { mode }).await?;
            debug!(from = %current, to = %mode, "Switched context");
        }

        {
            let mut state = self.state.lock();
            state.mode = Some(mode);
            state.running += 1;
        }
        self.changed.notify_waiters();
        Ok(true)
    }
}

// ============================================================================
// ContextGuard
// ============================================================================

/// Holds a place in a context; leaves on drop.
#[must_use = "dropping the guard leaves the context immediately"]
pub struct ContextGuard<'a> {
    manager: &'a ContextManager,
    mode: ContextMode,
}

impl ContextGuard<'_> {
    /// Returns the mode this guard holds.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> ContextMode {
        self.mode
    }
}

impl fmt::Debug for ContextGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.manager.leave();
    }
}

// ============================================================================
// Tests
// ============================================================================
