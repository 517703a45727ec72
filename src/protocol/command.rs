//! Command contract and built-in command catalog.
//!
//! Every request implements [`Command`]: a stable wire name, a parameter
//! payload, a client-side validity check evaluated before any I/O, and a
//! decoder for its success data.
//!
//! # Catalog
//!
//! | Type | Wire name | Output |
//! |------|-----------|--------|
//! | [`NewSession`] | `WebDriver:NewSession` | `Value` |
//! | [`GetWindowHandle`] | `WebDriver:GetWindowHandle` | [`WindowHandle`] |
//! | [`GetWindowHandles`] | `WebDriver:GetWindowHandles` | `Vec<WindowHandle>` |
//! | [`SwitchToWindow`] | `WebDriver:SwitchToWindow` | `()` |
//! | [`NewWindow`] | `WebDriver:NewWindow` | [`WindowHandle`] |
//! | [`CloseWindow`] | `WebDriver:CloseWindow` | `Vec<WindowHandle>` |
//! | [`GetContext`] | `Marionette:GetContext` | [`ContextMode`] |
//! | [`SetContext`] | `Marionette:SetContext` | `()` |
//! | [`ExecuteScript`] | `WebDriver:ExecuteScript` | `Value` |
//! | [`Navigate`] | `WebDriver:Navigate` | `()` |
//! | [`GetTitle`] | `WebDriver:GetTitle` | `String` |
//! | [`GetCurrentUrl`] | `WebDriver:GetCurrentURL` | `String` |
//! | [`FindElement`] | `WebDriver:FindElement` | [`ElementId`] |
//! | [`FindElements`] | `WebDriver:FindElements` | `Vec<ElementId>` |
//! | [`RawCommand`] | any | `Value` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::identifiers::{ElementId, WindowHandle};

use super::decode::{
    decode_element, decode_elements, decode_string, decode_unit, decode_value,
    decode_window_handle, decode_window_handles, unwrap_value,
};
use super::message::Reply;

// ============================================================================
// Command Trait
// ============================================================================

/// Minimal shape any request must satisfy to ride on the dispatcher.
pub trait Command {
    /// Decoded success type.
    type Output;

    /// Wire command name.
    fn name(&self) -> &str;

    /// Parameter payload; `null` when the command takes none.
    fn params(&self) -> Value {
        Value::Null
    }

    /// Client-side check evaluated before anything is sent.
    fn is_valid(&self) -> bool {
        true
    }

    /// Decodes success data into the command's output.
    fn decode(data: Value) -> Result<Self::Output>;

    /// Decodes a reply, propagating a driver error before looking at data.
    fn decode_reply(reply: Reply) -> Result<Self::Output> {
        let data = reply.into_result()?;
        Self::decode(data)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Starts a new automation session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Requested capabilities.
    pub capabilities: Value,
}

impl Command for NewSession {
    type Output = Value;

    fn name(&self) -> &str {
        "WebDriver:NewSession"
    }

    fn params(&self) -> Value {
        match &self.capabilities {
            Value::Null => json!({}),
            caps => json!({ "capabilities": caps }),
        }
    }

    fn decode(data: Value) -> Result<Value> {
        decode_value(data)
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Returns the handle of the current window.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetWindowHandle;

impl Command for GetWindowHandle {
    type Output = WindowHandle;

    fn name(&self) -> &str {
        "WebDriver:GetWindowHandle"
    }

    fn decode(data: Value) -> Result<WindowHandle> {
        decode_window_handle(data)
    }
}

/// Lists the handles of all open windows, in server enumeration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetWindowHandles;

impl Command for GetWindowHandles {
    type Output = Vec<WindowHandle>;

    fn name(&self) -> &str {
        "WebDriver:GetWindowHandles"
    }

    fn decode(data: Value) -> Result<Vec<WindowHandle>> {
        decode_window_handles(data)
    }
}

/// Makes `handle` the active window.
#[derive(Debug, Clone)]
pub struct SwitchToWindow {
    /// Target window.
    pub handle: WindowHandle,
    /// Whether to also give the window OS focus.
    pub focus: bool,
}

impl SwitchToWindow {
    /// Switches to `handle` with focus.
    #[inline]
    #[must_use]
    pub fn new(handle: WindowHandle) -> Self {
        Self {
            handle,
            focus: true,
        }
    }
}

impl Command for SwitchToWindow {
    type Output = ();

    fn name(&self) -> &str {
        "WebDriver:SwitchToWindow"
    }

    fn params(&self) -> Value {
        json!({ "handle": self.handle, "focus": self.focus })
    }

    fn is_valid(&self) -> bool {
        !self.handle.as_str().is_empty()
    }

    fn decode(data: Value) -> Result<()> {
        decode_unit(data)
    }
}

/// Kind of top-level browsing context to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// A new tab in the current window.
    #[default]
    Tab,
    /// A new OS-level window.
    Window,
}

/// Opens a new window or tab without switching to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewWindow {
    /// Tab or window.
    pub kind: WindowKind,
    /// Whether the new context should take focus.
    pub focus: bool,
}

impl Command for NewWindow {
    type Output = WindowHandle;

    fn name(&self) -> &str {
        "WebDriver:NewWindow"
    }

    fn params(&self) -> Value {
        json!({ "type": self.kind, "focus": self.focus })
    }

    fn decode(data: Value) -> Result<WindowHandle> {
        match data.get("handle").and_then(Value::as_str) {
            Some(handle) => Ok(WindowHandle::new(handle)),
            None => Err(Error::protocol(format!(
                "expected new window handle, got {data}"
            ))),
        }
    }
}

/// Closes the current window and returns the remaining handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseWindow;

impl Command for CloseWindow {
    type Output = Vec<WindowHandle>;

    fn name(&self) -> &str {
        "WebDriver:CloseWindow"
    }

    fn decode(data: Value) -> Result<Vec<WindowHandle>> {
        decode_window_handles(data)
    }
}

// ============================================================================
// Context
// ============================================================================

/// Execution context commands run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Privileged browser-chrome context.
    Chrome,
    /// Web page content context.
    Content,
}

impl ContextMode {
    /// Returns the wire name.
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Content => "content",
        }
    }
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queries the active execution context.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetContext;

impl Command for GetContext {
    type Output = ContextMode;

    fn name(&self) -> &str {
        "Marionette:GetContext"
    }

    fn decode(data: Value) -> Result<ContextMode> {
        let value = unwrap_value(data);
        serde_json::from_value(value.clone())
            .map_err(|_| Error::protocol(format!("expected context name, got {value}")))
    }
}

/// Changes the active execution context.
#[derive(Debug, Clone, Copy)]
pub struct SetContext {
    /// Context to switch to.
    pub mode: ContextMode,
}

impl Command for SetContext {
    type Output = ();

    fn name(&self) -> &str {
        "Marionette:SetContext"
    }

    fn params(&self) -> Value {
        json!({ "value": self.mode })
    }

    fn decode(data: Value) -> Result<()> {
        decode_unit(data)
    }
}

// ============================================================================
// Script
// ============================================================================

/// Runs a synchronous script in the active context.
#[derive(Debug, Clone)]
pub struct ExecuteScript {
    /// Function body to evaluate.
    pub script: String,
    /// Arguments exposed as `arguments[..]`.
    pub args: Vec<Value>,
}

impl ExecuteScript {
    /// Creates a script call without arguments.
    #[inline]
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
        }
    }
}

impl Command for ExecuteScript {
    type Output = Value;

    fn name(&self) -> &str {
        "WebDriver:ExecuteScript"
    }

    fn params(&self) -> Value {
        json!({ "script": self.script, "args": self.args })
    }

    fn is_valid(&self) -> bool {
        !self.script.is_empty()
    }

    fn decode(data: Value) -> Result<Value> {
        decode_value(data)
    }
}

// ============================================================================
// Navigation
// ============================================================================

/// Loads `url` in the active window.
#[derive(Debug, Clone)]
pub struct Navigate {
    /// Destination URL.
    pub url: String,
}

impl Command for Navigate {
    type Output = ();

    fn name(&self) -> &str {
        "WebDriver:Navigate"
    }

    fn params(&self) -> Value {
        json!({ "url": self.url })
    }

    fn is_valid(&self) -> bool {
        !self.url.is_empty()
    }

    fn decode(data: Value) -> Result<()> {
        decode_unit(data)
    }
}

/// Returns the document title.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetTitle;

impl Command for GetTitle {
    type Output = String;

    fn name(&self) -> &str {
        "WebDriver:GetTitle"
    }

    fn decode(data: Value) -> Result<String> {
        decode_string(data)
    }
}

/// Returns the current URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetCurrentUrl;

impl Command for GetCurrentUrl {
    type Output = String;

    fn name(&self) -> &str {
        "WebDriver:GetCurrentURL"
    }

    fn decode(data: Value) -> Result<String> {
        decode_string(data)
    }
}

// ============================================================================
// Elements
// ============================================================================

/// Element location strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locator {
    /// CSS selector.
    #[serde(rename = "css selector")]
    Css,
    /// Exact link text.
    #[serde(rename = "link text")]
    LinkText,
    /// Partial link text.
    #[serde(rename = "partial link text")]
    PartialLinkText,
    /// Tag name.
    #[serde(rename = "tag name")]
    TagName,
    /// XPath expression.
    #[serde(rename = "xpath")]
    XPath,
}

/// Finds the first element matching a locator.
#[derive(Debug, Clone)]
pub struct FindElement {
    /// Strategy.
    pub using: Locator,
    /// Selector text.
    pub value: String,
}

impl FindElement {
    /// Finds by CSS selector.
    #[inline]
    #[must_use]
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            using: Locator::Css,
            value: selector.into(),
        }
    }
}

impl Command for FindElement {
    type Output = ElementId;

    fn name(&self) -> &str {
        "WebDriver:FindElement"
    }

    fn params(&self) -> Value {
        json!({ "using": self.using, "value": self.value })
    }

    fn is_valid(&self) -> bool {
        !self.value.is_empty()
    }

    fn decode(data: Value) -> Result<ElementId> {
        decode_element(data)
    }
}

/// Finds all elements matching a locator.
#[derive(Debug, Clone)]
pub struct FindElements {
    /// Strategy.
    pub using: Locator,
    /// Selector text.
    pub value: String,
}

impl Command for FindElements {
    type Output = Vec<ElementId>;

    fn name(&self) -> &str {
        "WebDriver:FindElements"
    }

    fn params(&self) -> Value {
        json!({ "using": self.using, "value": self.value })
    }

    fn is_valid(&self) -> bool {
        !self.value.is_empty()
    }

    fn decode(data: Value) -> Result<Vec<ElementId>> {
        decode_elements(data)
    }
}

// ============================================================================
// Raw
// ============================================================================

/// Arbitrary command with caller-supplied name and parameters.
#[derive(Debug, Clone)]
pub struct RawCommand {
    /// Wire name.
    pub name: String,
    /// Parameters.
    pub params: Value,
}

impl RawCommand {
    /// Creates a raw command.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

impl Command for RawCommand {
    type Output = Value;

    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> Value {
        self.params.clone()
    }

    fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    fn decode(data: Value) -> Result<Value> {
        Ok(data)
    }
}

// ============================================================================
// Tests
// ============================================================================
