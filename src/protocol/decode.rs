//! Response shape decoders.
//!
//! Each command picks the decoder matching its expected result shape.
//! Driver errors are handled before any of these run (see
//! [`Command::decode_reply`](super::Command::decode_reply)), so the input
//! here is always success data.
//!
//! Non-object results arrive wrapped as `{"value": <scalar>}`; every
//! decoder accepts both the wrapped and the bare form.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{ElementId, WindowHandle};

// ============================================================================
// Constants
// ============================================================================

/// W3C web element reference key.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Legacy element reference key.
const LEGACY_ELEMENT_KEY: &str = "ELEMENT";

// ============================================================================
// Envelope
// ============================================================================

/// Strips the `{"value": ...}` wrapper if present.
#[must_use]
pub fn unwrap_value(data: Value) -> Value {
    match data {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("value") => {
            map.remove("value").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn shape_error(expected: &str, got: &Value) -> Error {
    Error::protocol(format!("expected {expected} result, got {got}"))
}

// ============================================================================
// Decoders
// ============================================================================

/// Accepts any success payload.
#[inline]
pub fn decode_unit(_data: Value) -> Result<()> {
    Ok(())
}

/// Returns the unwrapped value as-is.
#[inline]
pub fn decode_value(data: Value) -> Result<Value> {
    Ok(unwrap_value(data))
}

/// Decodes a string result.
pub fn decode_string(data: Value) -> Result<String> {
    match unwrap_value(data) {
        Value::String(s) => Ok(s),
        other => Err(shape_error("string", &other)),
    }
}

/// Decodes a boolean result.
pub fn decode_bool(data: Value) -> Result<bool> {
    match unwrap_value(data) {
        Value::Bool(b) => Ok(b),
        other => Err(shape_error("boolean", &other)),
    }
}

/// Decodes a list of strings.
pub fn decode_string_list(data: Value) -> Result<Vec<String>> {
    match unwrap_value(data) {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(shape_error("string list", &other)),
            })
            .collect(),
        other => Err(shape_error("string list", &other)),
    }
}

/// Decodes a window handle.
pub fn decode_window_handle(data: Value) -> Result<WindowHandle> {
    decode_string(data).map(WindowHandle::new)
}

/// Decodes a list of window handles.
pub fn decode_window_handles(data: Value) -> Result<Vec<WindowHandle>> {
    Ok(decode_string_list(data)?
        .into_iter()
        .map(WindowHandle::new)
        .collect())
}

/// Decodes a single element reference.
pub fn decode_element(data: Value) -> Result<ElementId> {
    element_from(unwrap_value(data))
}

/// Decodes a list of element references.
pub fn decode_elements(data: Value) -> Result<Vec<ElementId>> {
    match unwrap_value(data) {
        Value::Array(items) => items.into_iter().map(element_from).collect(),
        other => Err(shape_error("element list", &other)),
    }
}

fn element_from(value: Value) -> Result<ElementId> {
    let id = value
        .get(ELEMENT_KEY)
        .or_else(|| value.get(LEGACY_ELEMENT_KEY))
        .and_then(Value::as_str);

    match id {
        Some(id) => Ok(ElementId::new(id)),
        None => Err(shape_error("element reference", &value)),
    }
}

// ============================================================================
// Tests
// ============================================================================
