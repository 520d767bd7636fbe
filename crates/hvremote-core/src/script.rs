//! Script payloads: a trusted skeleton plus typed substitution values.
//!
//! The skeleton is written by the caller and never escaped. Values are
//! spliced into `{{Name}}` placeholders according to their type:
//!
//! | type    | rendering                                             |
//! |---------|-------------------------------------------------------|
//! | string  | single-quoted literal                                 |
//! | path    | single-quoted literal; NUL, CR, LF and `"` rejected   |
//! | enum    | bare word; only `[A-Za-z0-9_]` allowed                |
//! | integer | decimal                                               |
//! | boolean | `$true` / `$false`                                    |
//! | json    | single-quoted JSON text, for `ConvertFrom-Json`       |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::powershell::quote;

/// Script render error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("No value supplied for placeholder {{{{{0}}}}}")]
    MissingValue(String),
    #[error("Unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error("Invalid placeholder name: {0:?}")]
    InvalidName(String),
    #[error("Invalid path for {name}: {reason}")]
    InvalidPath { name: String, reason: &'static str },
    #[error("Invalid enum value for {name}: {value:?}")]
    InvalidEnum { name: String, value: String },
    #[error("Value for {name} is not serializable: {message}")]
    Serialize { name: String, message: String },
}

/// A typed substitution value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScriptValue {
    String(String),
    Path(String),
    Enum(String),
    Int(i64),
    Bool(bool),
    Json(Value),
}

impl ScriptValue {
    fn render(&self, name: &str) -> Result<String, RenderError> {
        match self {
            Self::String(s) => Ok(quote(s)),
            Self::Path(p) => {
                let reason = if p.is_empty() {
                    Some("empty")
                } else if p.contains('\0') {
                    Some("contains NUL")
                } else if p.contains(['\r', '\n']) {
                    Some("contains a line break")
                } else if p.contains('"') {
                    Some("contains a double quote")
                } else {
                    None
                };
                match reason {
                    Some(reason) => Err(RenderError::InvalidPath {
                        name: name.to_string(),
                        reason,
                    }),
                    None => Ok(quote(p)),
                }
            }
            Self::Enum(v) => {
                if !v.is_empty() && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    Ok(v.clone())
                } else {
                    Err(RenderError::InvalidEnum {
                        name: name.to_string(),
                        value: v.clone(),
                    })
                }
            }
            Self::Int(i) => Ok(i.to_string()),
            Self::Bool(true) => Ok("$true".to_string()),
            Self::Bool(false) => Ok("$false".to_string()),
            Self::Json(v) => Ok(quote(&v.to_string())),
        }
    }
}

/// A script skeleton with its substitution values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    skeleton: String,
    #[serde(default)]
    values: BTreeMap<String, ScriptValue>,
}

impl Script {
    /// Create a script from a trusted skeleton.
    #[must_use]
    pub fn new(skeleton: impl Into<String>) -> Self {
        Self {
            skeleton: skeleton.into(),
            values: BTreeMap::new(),
        }
    }

    /// The unrendered skeleton.
    #[must_use]
    pub fn skeleton(&self) -> &str {
        &self.skeleton
    }

    /// Get a value by placeholder name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ScriptValue> {
        self.values.get(name)
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, name: impl Into<String>, value: ScriptValue) {
        self.values.insert(name.into(), value);
    }

    /// Add a string value.
    #[must_use]
    pub fn string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, ScriptValue::String(value.into()));
        self
    }

    /// Add a path value.
    #[must_use]
    pub fn path(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, ScriptValue::Path(value.into()));
        self
    }

    /// Add an enum value.
    #[must_use]
    pub fn enumeration(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, ScriptValue::Enum(value.into()));
        self
    }

    /// Add an integer value.
    #[must_use]
    pub fn int(mut self, name: impl Into<String>, value: i64) -> Self {
        self.set(name, ScriptValue::Int(value));
        self
    }

    /// Add a boolean value.
    #[must_use]
    pub fn bool(mut self, name: impl Into<String>, value: bool) -> Self {
        self.set(name, ScriptValue::Bool(value));
        self
    }

    /// Add a JSON value.
    #[must_use]
    pub fn json(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, ScriptValue::Json(value));
        self
    }

    /// Add any serializable value as JSON.
    ///
    /// # Errors
    /// Returns error if the value cannot be serialized.
    pub fn serialized<T: Serialize + ?Sized>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, RenderError> {
        let name = name.into();
        let json = serde_json::to_value(value).map_err(|e| RenderError::Serialize {
            name: name.clone(),
            message: e.to_string(),
        })?;
        Ok(self.json(name, json))
    }

    /// Render the final script text.
    ///
    /// # Errors
    /// Returns error if a placeholder has no value or a value violates its
    /// escaping contract.
    pub fn render(&self) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.skeleton.len());
        let mut rest = self.skeleton.as_str();
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(RenderError::Unterminated(offset + start))?;
            let name = after[..end].trim();
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(RenderError::InvalidName(name.to_string()));
            }
            let value = self
                .values
                .get(name)
                .ok_or_else(|| RenderError::MissingValue(name.to_string()))?;
            out.push_str(&value.render(name)?);

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
