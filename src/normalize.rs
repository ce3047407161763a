//! Total, side-effect free field access over platform-native JSON items.
//!
//! Adapters map raw items into canonical records through [`Fields`]. A missing or
//! mistyped field never fails the mapping: it becomes `None` and, where the field is
//! one the platform always sends, a [`ShapeWarning`] is recorded for the caller to log.

use crate::fetch::kind_of;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A field that did not have the expected shape on a raw item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeWarning {
    pub field: String,
    pub detail: String,
}

impl fmt::Display for ShapeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.detail)
    }
}

/// A best-effort mapping result plus the shape problems met on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub value: T,
    pub warnings: Vec<ShapeWarning>,
}

impl<T> Normalized<T> {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Logs each distinct shape problem of one platform once; repeats only go to debug.
#[derive(Debug, Clone, Default)]
pub struct ShapeLog {
    seen: Arc<Mutex<HashSet<(&'static str, ShapeWarning)>>>,
}

impl ShapeLog {
    /// Logs the `warnings` met while mapping one item of `kind` ("post" or "profile").
    ///
    /// # Returns
    ///
    /// The number of warnings not seen before on this log.
    pub fn record(&self, source: &str, kind: &'static str, warnings: &[ShapeWarning]) -> usize {
        let mut fresh = 0;
        for warning in warnings {
            let first = self
                .seen
                .lock()
                .map_or(true, |mut seen| seen.insert((kind, warning.clone())));
            if first {
                fresh += 1;
                warn!(platform = source, kind, %warning, "Unexpected item shape");
            } else {
                debug!(platform = source, kind, %warning, "Unexpected item shape (repeated)");
            }
        }
        fresh
    }
}

/// Reads fields of one raw item by JSON pointer, collecting shape warnings.
pub struct Fields<'a> {
    item: &'a Value,
    warnings: Vec<ShapeWarning>,
}

impl<'a> Fields<'a> {
    pub fn new(item: &'a Value) -> Self {
        let mut fields = Self {
            item,
            warnings: Vec::new(),
        };
        if !item.is_object() {
            fields.warn("", format!("expected an object, got {}", kind_of(item)));
        }
        fields
    }

    /// Switches to a nested object, keeping the warnings gathered so far.
    pub fn rebase(self, item: &'a Value) -> Self {
        Self {
            item,
            warnings: self.warnings,
        }
    }

    /// The value at `pointer`, treating JSON `null` as absent.
    pub fn get(&self, pointer: &str) -> Option<&'a Value> {
        self.item.pointer(pointer).filter(|v| !v.is_null())
    }

    pub fn warn(&mut self, field: &str, detail: impl Into<String>) {
        self.warnings.push(ShapeWarning {
            field: field.to_string(),
            detail: detail.into(),
        });
    }

    /// A string field the platform always sends.
    pub fn string(&mut self, pointer: &str) -> Option<String> {
        match self.get(pointer) {
            None => {
                self.warn(pointer, "missing");
                None
            }
            Some(value) => self.as_string(pointer, value),
        }
    }

    /// A string field the platform may leave out.
    pub fn opt_string(&mut self, pointer: &str) -> Option<String> {
        let value = self.get(pointer)?;
        self.as_string(pointer, value)
    }

    /// A counter the platform always sends.
    pub fn count(&mut self, pointer: &str) -> Option<u64> {
        match self.get(pointer) {
            None => {
                self.warn(pointer, "missing");
                None
            }
            Some(value) => self.as_count(pointer, value),
        }
    }

    /// A counter the platform may leave out.
    pub fn opt_count(&mut self, pointer: &str) -> Option<u64> {
        let value = self.get(pointer)?;
        self.as_count(pointer, value)
    }

    /// An RFC 3339 timestamp the platform always sends.
    pub fn timestamp(&mut self, pointer: &str) -> Option<DateTime<Utc>> {
        let raw = self.string(pointer)?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(e) => {
                self.warn(pointer, format!("unparseable timestamp {raw:?}: {e}"));
                None
            }
        }
    }

    pub fn finish<T>(self, value: T) -> Normalized<T> {
        Normalized {
            value,
            warnings: self.warnings,
        }
    }

    fn as_string(&mut self, pointer: &str, value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            other => {
                self.warn(pointer, format!("expected a string, got {}", kind_of(other)));
                None
            }
        }
    }

    fn as_count(&mut self, pointer: &str, value: &Value) -> Option<u64> {
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        if parsed.is_none() {
            self.warn(pointer, format!("expected a count, got {value}"));
        }
        parsed
    }
}
