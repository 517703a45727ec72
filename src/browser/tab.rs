//! Tab/window arbitration.
//!
//! The remote end routes window-scoped commands to a single active
//! window. [`TabManager`] binds logical tab names to window handles once,
//! at construction, and serializes every tab-scoped command behind one
//! lock: switch to the tab's window if needed, run the command, release.
//!
//! # Example
//!
//! ```ignore
//! let manager = TabManager::new(client, ["main", "popup"]).await?;
//!
//! let main = manager.tab("main")?;
//! let popup = manager.tab("popup")?;
//!
//! // Each call switches windows only when the other tab was active
//! main.navigate("https://example.com").await?;
//! let title = popup.title().await?;
//! ```
//!
//! Tabs cannot run commands in parallel: the remote end has one active
//! window, so the lock makes that serialization race-free and skips the
//! switch when the requested tab is already active.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, trace, warn};

use crate::error::{DriverErrorKind, Error, Result};
use crate::identifiers::{ElementId, WindowHandle};
use crate::protocol::{
    CloseWindow, Command, ExecuteScript, FindElement, GetCurrentUrl, GetTitle, GetWindowHandles,
    Navigate, NewWindow, SwitchToWindow,
};
use crate::transport::Dispatcher;

// ============================================================================
// Constants
// ============================================================================

/// Script used to open a window when `NewWindow` is not supported.
const OPEN_BLANK_WINDOW_SCRIPT: &str = "window.open('about:blank', '_blank'); return null;";

// ============================================================================
// Types
// ============================================================================

/// Tracked server-side active window.
///
/// Only mutated while the manager's lock is held.
#[derive(Debug, Default)]
pub struct ActiveWindow {
    handle: Option<WindowHandle>,
}

/// Immutable name → handle binding, in enumeration order.
struct TabRegistry {
    names: Vec<String>,
    handles: FxHashMap<String, WindowHandle>,
}

impl TabRegistry {
    fn handle(&self, name: &str) -> Option<&WindowHandle> {
        self.handles.get(name)
    }
}

// ============================================================================
// TabLease
// ============================================================================

/// Proof that the caller holds the tab lock.
///
/// Dropping the lease (or passing it to [`TabManager::release_tab`])
/// releases the lock.
pub struct TabLease {
    guard: OwnedMutexGuard<ActiveWindow>,
    name: String,
}

impl TabLease {
    /// Returns the tab name this lease was requested for.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tracked active window while the lock is held.
    #[inline]
    #[must_use]
    pub fn active_handle(&self) -> Option<&WindowHandle> {
        self.guard.handle.as_ref()
    }
}

impl fmt::Debug for TabLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabLease")
            .field("name", &self.name)
            .field("active", &self.guard.handle)
            .finish()
    }
}

/// Failed allocation; the lock is still held by `lease`.
#[derive(Debug)]
pub struct TabLeaseError {
    /// The still-held lock.
    pub lease: TabLease,
    /// Why the switch failed.
    pub error: Error,
}

impl TabLeaseError {
    /// Releases the lock and returns the error.
    #[must_use]
    pub fn into_error(self) -> Error {
        self.error
    }
}

impl fmt::Display for TabLeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocating tab {:?} failed: {}", self.lease.name, self.error)
    }
}

impl std::error::Error for TabLeaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ============================================================================
// TabManager
// ============================================================================

/// Arbitrates the single active-window resource between named tabs.
pub struct TabManager {
    client: Dispatcher,
    registry: TabRegistry,
    active: Arc<Mutex<ActiveWindow>>,
}

impl fmt::Debug for TabManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabManager")
            .field("tabs", &self.registry.names)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TabManager - Constructor
// ============================================================================

impl TabManager {
    /// Reconciles open windows with `names` and binds each name to a handle.
    ///
    /// Opens windows while fewer than `names.len()` exist and closes the
    /// surplus otherwise. Names bind to handles in server enumeration
    /// order; the first tab is left active.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `names` is empty or contains duplicates
    /// - [`Error::Protocol`] if the window count does not settle
    /// - any error from the window commands
    pub async fn new<I, S>(client: Dispatcher, names: I) -> Result<Arc<Self>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        Self::check_names(&names)?;

        let handles = Self::reconcile(&client, names.len()).await?;

        let first = handles[0].clone();
        client.execute(&SwitchToWindow::new(first.clone())).await?;

        let registry = TabRegistry {
            handles: names.iter().cloned().zip(handles).collect(),
            names,
        };
        info!(tabs = ?registry.names, "Tabs bound to windows");

        Ok(Arc::new(Self {
            client,
            registry,
            active: Arc::new(Mutex::new(ActiveWindow {
                handle: Some(first),
            })),
        }))
    }

    fn check_names(names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Err(Error::config("at least one tab name is required"));
        }

        let mut seen = FxHashSet::default();
        for name in names {
            if name.is_empty() {
                return Err(Error::config("tab names must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::config(format!("duplicate tab name {name:?}")));
            }
        }
        Ok(())
    }

    /// Opens or closes windows until exactly `wanted` exist.
    async fn reconcile(client: &Dispatcher, wanted: usize) -> Result<Vec<WindowHandle>> {
        let mut handles = client.execute(&GetWindowHandles).await?;
        let found = handles.len();

        if found < wanted {
            debug!(found, wanted, "Opening windows");
            for _ in found..wanted {
                Self::open_window(client).await?;
            }
            handles = client.execute(&GetWindowHandles).await?;
        } else if found > wanted {
            debug!(found, wanted, "Closing surplus windows");
            for extra in handles.split_off(wanted) {
                client.execute(&SwitchToWindow::new(extra)).await?;
                client.execute(&CloseWindow).await?;
            }
            handles = client.execute(&GetWindowHandles).await?;
        }

        if handles.len() != wanted {
            return Err(Error::protocol(format!(
                "expected {wanted} windows after reconciling, server reports {}",
                handles.len()
            )));
        }
        Ok(handles)
    }

    /// Opens one window, falling back to a script if `NewWindow` is
    /// unsupported.
    async fn open_window(client: &Dispatcher) -> Result<()> {
        match client.execute(&NewWindow::default()).await {
            Ok(handle) => {
                trace!(%handle, "Window opened");
                Ok(())
            }
            Err(e)
                if matches!(
                    e.driver_kind(),
                    Some(DriverErrorKind::UnknownCommand | DriverErrorKind::UnsupportedOperation)
                ) =>
            {
                warn!(error = %e, "NewWindow unsupported, opening blank window by script");
                client
                    .execute(&ExecuteScript::new(OPEN_BLANK_WINDOW_SCRIPT))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// TabManager - Public API
// ============================================================================

impl TabManager {
    /// Acquires the tab lock and makes `name` the active window.
    ///
    /// Waits until the lock is free. If `name` is already active, no switch
    /// is sent. The lock is held on return whether or not the switch
    /// succeeded: on failure it travels in [`TabLeaseError::lease`], and the
    /// caller decides when to release it.
    ///
    /// # Errors
    ///
    /// - [`Error::TabNotFound`] if `name` is not registered
    /// - any error from the switch command
    pub async fn allocate_tab(&self, name: &str) -> std::result::Result<TabLease, TabLeaseError> {
        let mut guard = Arc::clone(&self.active).lock_owned().await;
        let outcome = self.activate(&mut guard, name).await;

        let lease = TabLease {
            guard,
            name: name.to_string(),
        };
        match outcome {
            Ok(()) => Ok(lease),
            Err(error) => Err(TabLeaseError { lease, error }),
        }
    }

    /// Releases the tab lock.
    #[inline]
    pub fn release_tab(&self, lease: TabLease) {
        trace!(tab = lease.name(), "Tab released");
        drop(lease);
    }

    /// Returns a handle that runs commands in tab `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TabNotFound`] if `name` is not registered.
    pub fn tab(self: &Arc<Self>, name: &str) -> Result<Tab> {
        if self.registry.handle(name).is_none() {
            return Err(Error::tab_not_found(name));
        }
        Ok(Tab {
            name: name.to_string(),
            manager: Arc::clone(self),
        })
    }

    /// Returns the registered tab names in binding order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registry.names.iter().map(String::as_str)
    }

    /// Returns the window handle bound to `name`.
    #[inline]
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<&WindowHandle> {
        self.registry.handle(name)
    }

    /// Returns the underlying command issuer.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &Dispatcher {
        &self.client
    }

    async fn activate(&self, active: &mut ActiveWindow, name: &str) -> Result<()> {
        let handle = self
            .registry
            .handle(name)
            .ok_or_else(|| Error::tab_not_found(name))?;

        if active.handle.as_ref() == Some(handle) {
            trace!(tab = name, "Tab already active");
            return Ok(());
        }

        self.client
            .execute(&SwitchToWindow::new(handle.clone()))
            .await?;
        debug!(tab = name, %handle, "Switched active window");

        active.handle = Some(handle.clone());
        Ok(())
    }
}

// ============================================================================
// Tab
// ============================================================================

/// A named tab: wraps every command in allocate/release.
///
/// Holds only its name and the shared manager; all tab state lives in
/// the manager.
#[derive(Clone)]
pub struct Tab {
    name: String,
    manager: Arc<TabManager>,
}

impl fmt::Debug for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tab")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Tab {
    /// Returns the tab name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the window handle this tab is bound to.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Option<&WindowHandle> {
        self.manager.handle(&self.name)
    }

    /// Runs `cmd` with this tab's window active.
    ///
    /// The tab lock is released afterwards whatever the outcome.
    pub async fn execute<C: Command>(&self, cmd: &C) -> Result<C::Output> {
        let lease = match self.manager.allocate_tab(&self.name).await {
            Ok(lease) => lease,
            Err(failed) => {
                self.manager.release_tab(failed.lease);
                return Err(failed.error);
            }
        };

        let result = self.manager.client.execute(cmd).await;
        self.manager.release_tab(lease);
        result
    }

    /// Loads `url`.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.execute(&Navigate {
            url: url.to_string(),
        })
        .await
    }

    /// Returns the document title.
    pub async fn title(&self) -> Result<String> {
        self.execute(&GetTitle).await
    }

    /// Returns the current URL.
    pub async fn current_url(&self) -> Result<String> {
        self.execute(&GetCurrentUrl).await
    }

    /// Finds the first element matching a CSS selector.
    pub async fn find_element(&self, selector: &str) -> Result<ElementId> {
        self.execute(&FindElement::css(selector)).await
    }

    /// Runs a synchronous script with `args`.
    pub async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.execute(&ExecuteScript {
            script: script.to_string(),
            args,
        })
        .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures_util::future::join_all;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use tokio::time::timeout;

    use crate::config::ClientOptions;
    use crate::protocol::RawCommand;
    use crate::testing::{MockReply, MockServer, Received};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Server-side window model shared with the test body.
    #[derive(Debug, Default)]
    struct Windows {
        open: Vec<String>,
        current: Option<String>,
        next_id: u32,
        mismatches: usize,
        new_window_supported: bool,
        fail_switch_to: Option<String>,
    }

    impl Windows {
        fn with_open(count: usize) -> Self {
            let mut windows = Self {
                new_window_supported: true,
                ..Self::default()
            };
            for _ in 0..count {
                windows.open_one();
            }
            windows.current = windows.open.first().cloned();
            windows
        }

        fn open_one(&mut self) -> String {
            self.next_id += 1;
            let handle = format!("w{}", self.next_id);
            self.open.push(handle.clone());
            handle
        }

        fn handle(&mut self, cmd: &Received) -> MockReply {
            match cmd.name.as_str() {
                "WebDriver:GetWindowHandles" => MockReply::value(json!(self.open)),
                "WebDriver:NewWindow" if self.new_window_supported => {
                    let handle = self.open_one();
                    MockReply::ok(json!({"handle": handle, "type": "tab"}))
                }
                "WebDriver:NewWindow" => {
                    MockReply::err(DriverErrorKind::UnknownCommand, "WebDriver:NewWindow")
                }
                "WebDriver:ExecuteScript" => {
                    self.open_one();
                    MockReply::value(Value::Null)
                }
                "WebDriver:SwitchToWindow" => {
                    let target = cmd.params["handle"].as_str().unwrap_or_default().to_string();
                    if self.fail_switch_to.as_deref() == Some(target.as_str())
                        || !self.open.contains(&target)
                    {
                        return MockReply::err(DriverErrorKind::NoSuchWindow, &target);
                    }
                    self.current = Some(target);
                    MockReply::value(Value::Null)
                }
                "WebDriver:CloseWindow" => {
                    if let Some(current) = self.current.take() {
                        self.open.retain(|h| *h != current);
                    }
                    MockReply::value(json!(self.open))
                }
                "WebDriver:GetTitle" => MockReply::value(json!(self.current)),
                "test:Mark" => {
                    let expected = cmd.params["expect"].as_str().map(str::to_string);
                    if self.current != expected {
                        self.mismatches += 1;
                    }
                    MockReply::Delayed(Duration::from_millis(1), json!({"value": null}))
                }
                _ => MockReply::value(Value::Null),
            }
        }
    }

    fn spawn_windows(windows: Windows) -> (MockServer, tokio::io::DuplexStream, Arc<SyncMutex<Windows>>) {
        let state = Arc::new(SyncMutex::new(windows));
        let shared = Arc::clone(&state);
        let (server, stream) = MockServer::spawn(move |cmd| shared.lock().handle(cmd));
        (server, stream, state)
    }

    async fn open(stream: tokio::io::DuplexStream) -> Dispatcher {
        Dispatcher::open(stream, &ClientOptions::new())
            .await
            .expect("open dispatcher")
    }

    #[tokio::test]
    async fn test_opens_missing_windows_and_binds_in_order() {
        let (server, stream, state) = spawn_windows(Windows::with_open(1));
        let manager = TabManager::new(open(stream).await, ["a", "b", "c"])
            .await
            .expect("manager");

        assert_eq!(server.count("WebDriver:NewWindow"), 2);
        assert_eq!(manager.handle("a"), Some(&WindowHandle::new("w1")));
        assert_eq!(manager.handle("b"), Some(&WindowHandle::new("w2")));
        assert_eq!(manager.handle("c"), Some(&WindowHandle::new("w3")));
        assert_eq!(manager.names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(state.lock().current.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_falls_back_to_script_when_new_window_unsupported() {
        let mut windows = Windows::with_open(1);
        windows.new_window_supported = false;
        let (server, stream, _state) = spawn_windows(windows);

        let manager = TabManager::new(open(stream).await, ["a", "b"])
            .await
            .expect("manager");

        assert_eq!(server.count("WebDriver:ExecuteScript"), 1);
        assert_eq!(manager.handle("b"), Some(&WindowHandle::new("w2")));
    }

    #[tokio::test]
    async fn test_closes_surplus_windows() {
        let (server, stream, state) = spawn_windows(Windows::with_open(3));
        let manager = TabManager::new(open(stream).await, ["only"])
            .await
            .expect("manager");

        assert_eq!(server.count("WebDriver:CloseWindow"), 2);
        assert_eq!(state.lock().open, vec!["w1".to_string()]);
        assert_eq!(manager.handle("only"), Some(&WindowHandle::new("w1")));
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let (_server, stream, _state) = spawn_windows(Windows::with_open(1));
        let client = open(stream).await;

        let empty: [&str; 0] = [];
        assert!(matches!(
            TabManager::new(client.clone(), empty).await,
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            TabManager::new(client, ["a", "a"]).await,
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_active_tab_needs_no_switch() {
        let (server, stream, _state) = spawn_windows(Windows::with_open(2));
        let manager = TabManager::new(open(stream).await, ["a", "b"])
            .await
            .expect("manager");
        let switches_after_setup = server.count("WebDriver:SwitchToWindow");

        let tab = manager.tab("a").expect("tab");
        for _ in 0..3 {
            tab.title().await.expect("title");
        }

        assert_eq!(server.count("WebDriver:SwitchToWindow"), switches_after_setup);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_tabs_never_run_in_wrong_window() {
        let (server, stream, state) = spawn_windows(Windows::with_open(1));
        let manager = TabManager::new(open(stream).await, ["a", "b"])
            .await
            .expect("manager");

        let calls = (0..40).map(|i| {
            let name = if i % 2 == 0 { "a" } else { "b" };
            let tab = manager.tab(name).expect("tab");
            tokio::spawn(async move {
                let expect = tab.handle().expect("bound").to_string();
                tab.execute(&RawCommand::new("test:Mark", json!({ "expect": expect })))
                    .await
            })
        });

        let results = timeout(TEST_TIMEOUT, join_all(calls))
            .await
            .expect("timed out");
        for result in results {
            result.expect("task").expect("mark");
        }

        assert_eq!(state.lock().mismatches, 0);
        assert_eq!(server.count("test:Mark"), 40);
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_lock_held() {
        let (_server, stream, state) = spawn_windows(Windows::with_open(2));
        let manager = TabManager::new(open(stream).await, ["a", "b"])
            .await
            .expect("manager");
        state.lock().fail_switch_to = Some("w2".to_string());

        let failed = manager.allocate_tab("b").await.unwrap_err();
        assert_eq!(failed.error.driver_kind(), Some(DriverErrorKind::NoSuchWindow));
        // Tracked window is unchanged
        assert_eq!(failed.lease.active_handle(), Some(&WindowHandle::new("w1")));

        // Nobody else gets in while the failed lease is held
        let blocked = timeout(Duration::from_millis(50), manager.allocate_tab("a")).await;
        assert!(blocked.is_err());

        manager.release_tab(failed.lease);
        let lease = timeout(TEST_TIMEOUT, manager.allocate_tab("a"))
            .await
            .expect("timed out")
            .expect("allocate");
        assert_eq!(lease.name(), "a");
    }

    #[tokio::test]
    async fn test_unknown_tab() {
        let (_server, stream, _state) = spawn_windows(Windows::with_open(1));
        let manager = TabManager::new(open(stream).await, ["a"])
            .await
            .expect("manager");

        assert!(matches!(manager.tab("zzz"), Err(Error::TabNotFound { .. })));
        let failed = manager.allocate_tab("zzz").await.unwrap_err();
        assert!(matches!(failed.into_error(), Error::TabNotFound { .. }));
    }
}
