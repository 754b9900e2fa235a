use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

/// A secret string that can be serialized back out.
///
/// [`secrecy::SecretString`] deliberately does not implement [`Serialize`], but
/// connection configs are round-tripped through files and env overrides, so we
/// wrap it here. Debug output stays redacted.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct SerializableSecretString(SecretString);

impl SerializableSecretString {
    /// Exposes the inner secret value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SerializableSecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerializableSecretString([REDACTED])")
    }
}

impl Serialize for SerializableSecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.expose_secret())
    }
}

impl From<String> for SerializableSecretString {
    fn from(value: String) -> Self {
        Self(SecretString::new(value))
    }
}

impl From<SecretString> for SerializableSecretString {
    fn from(value: SecretString) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_is_redacted() {
        let secret = SerializableSecretString::from("hunter2".to_string());
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn serialization_exposes_value() {
        let secret = SerializableSecretString::from("hunter2".to_string());
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"hunter2\"");
    }
}
