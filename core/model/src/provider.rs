use serde::{Deserialize, Serialize};

/// Persisted configuration of one upstream provider. `name` is the
/// registry key and primary key of the `provider_config` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    pub display_name: String,
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u32 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl ProviderConfig {
    /// Adapter family resolved from the extra blob, falling back to the
    /// provider name. Unrecognized families build as OpenAI-compatible.
    pub fn family(&self) -> &str {
        if let Some(family) = self
            .extra
            .as_ref()
            .and_then(|extra| extra.get("family"))
            .and_then(|family| family.as_str())
        {
            return if family.eq_ignore_ascii_case("gemini") {
                "gemini"
            } else {
                "openai"
            };
        }
        if self.name.starts_with("gemini") {
            "gemini"
        } else {
            "openai"
        }
    }
}

/// Stable snapshot of a registered adapter, suitable for UI listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub name: String,
    pub display_name: String,
    pub family: String,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, extra: Option<serde_json::Value>) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            display_name: name.into(),
            api_base: "http://localhost".into(),
            api_key: String::new(),
            extra,
            enabled: true,
            timeout_secs: 120,
            max_retries: 3,
        }
    }

    #[test]
    fn family_falls_back_to_name_prefix() {
        assert_eq!(config("gemini", None).family(), "gemini");
        assert_eq!(config("gemini-pro", None).family(), "gemini");
        assert_eq!(config("openai", None).family(), "openai");
        assert_eq!(config("my-relay", None).family(), "openai");
    }

    #[test]
    fn family_prefers_extra_blob() {
        let extra = serde_json::json!({ "family": "gemini" });
        assert_eq!(config("my-relay", Some(extra)).family(), "gemini");
    }

    #[test]
    fn defaults_applied_on_deserialize() {
        let parsed: ProviderConfig = serde_json::from_str(
            r#"{"name":"x","displayName":"X","apiBase":"http://up"}"#,
        )
        .unwrap();
        assert!(parsed.enabled);
        assert_eq!(parsed.timeout_secs, 120);
        assert_eq!(parsed.max_retries, 3);
    }
}
