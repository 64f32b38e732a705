//! Typed access to validated tool arguments.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{KilnError, Result};

/// Arguments passed to a tool, already checked against its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArguments {
    raw: Value,
}

impl ToolArguments {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.get_str_opt(key)
            .ok_or_else(|| KilnError::Validation(format!("missing string argument '{key}'")))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        self.get_i64_opt(key)
            .ok_or_else(|| KilnError::Validation(format!("missing integer argument '{key}'")))
    }

    pub fn get_i64_opt(&self, key: &str) -> Option<i64> {
        self.raw.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.raw.get(key).and_then(Value::as_bool)
    }

    /// Deserialize the whole argument object.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.raw.clone())?)
    }

    /// Deserialize one field.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .raw
            .get(key)
            .cloned()
            .ok_or_else(|| KilnError::Validation(format!("missing argument '{key}'")))?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn typed_getters() {
        let args = ToolArguments::new(json!({ "path": "a.txt", "limit": 10, "force": true }));
        assert_eq!(args.get_str("path").unwrap(), "a.txt");
        assert_eq!(args.get_i64("limit").unwrap(), 10);
        assert_eq!(args.get_bool("force"), Some(true));
        assert!(args.get_str("missing").is_err());
        assert_eq!(args.get_str_opt("limit"), None);
    }

    #[test]
    fn deserializes_fields() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Call {
            tool: String,
        }
        let args = ToolArguments::new(json!({ "calls": [{ "tool": "read" }] }));
        let calls: Vec<Call> = args.field("calls").unwrap();
        assert_eq!(calls, vec![Call { tool: "read".into() }]);
        assert!(args.field::<Vec<Call>>("other").is_err());
    }
}
