use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use turnstile_core::CompletionSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Provider used when `--provider` is not given
    #[serde(default)]
    pub default_provider: Option<String>,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfigEntry>,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    OpenRouter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfigEntry {
    /// Wire protocol; inferred from the name and base_url when absent
    #[serde(default)]
    pub kind: Option<ProviderKind>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the key
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Extra request parameters (e.g., reasoning_effort)
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session resumed when `--session` is not given
    #[serde(default)]
    pub id: Option<String>,

    /// Directory of session files (default: <data dir>/turnstile/sessions)
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl Config {
    /// Load the TOML file (if present) layered under `TURNSTILE_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        tracing::debug!(path = %path.display(), exists = path.exists(), "Loading configuration");

        Self::extract(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("TURNSTILE_").split("__")),
        )
        .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn extract(figment: Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("turnstile"))
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.session.store_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(data_dir.join("turnstile").join("sessions"))
    }

    /// Resolve the provider to talk to: CLI override > `default_provider` > "openai".
    pub fn resolve_provider(&self, name: Option<&str>, model: Option<&str>) -> Result<ResolvedProvider> {
        let name = name
            .map(str::to_string)
            .or_else(|| self.default_provider.clone())
            .unwrap_or_else(|| "openai".to_string());
        let entry = self.providers.get(&name).cloned().unwrap_or_default();

        let kind = resolve_provider_kind(entry.kind, &name, entry.base_url.as_deref());

        let env_name = entry
            .api_key_env
            .clone()
            .unwrap_or_else(|| format!("{}_API_KEY", name.to_uppercase().replace('-', "_")));
        let api_key = entry
            .api_key
            .clone()
            .or_else(|| std::env::var(&env_name).ok())
            // OpenAI-compatible local servers usually take no key.
            .or_else(|| (kind == ProviderKind::OpenAi && entry.base_url.is_some()).then(String::new))
            .with_context(|| {
                format!(
                    "API key not found for provider '{name}'. Set {env_name} or configure [providers.{name}] in {}",
                    Self::config_path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| "config.toml".to_string())
                )
            })?;

        Ok(ResolvedProvider {
            model: model.map(str::to_string).or(entry.default_model),
            name,
            kind,
            api_key,
            base_url: entry.base_url,
            parameters: entry.parameters,
        })
    }

    /// Completion settings for one session; `system` overrides the configured prompt.
    pub fn completion_settings(&self, provider: &ResolvedProvider, system: Option<&str>) -> CompletionSettings {
        let mut settings = CompletionSettings::new().with_extra(provider.parameters.clone());
        if let Some(model) = &provider.model {
            settings = settings.with_model(model);
        }
        if let Some(prompt) = system.map(str::to_string).or_else(|| self.completion.system_prompt.clone()) {
            settings = settings.with_system_prompt(prompt);
        }
        if let Some(temperature) = self.completion.temperature {
            settings = settings.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.completion.max_tokens {
            settings = settings.with_max_tokens(max_tokens);
        }
        settings
    }
}

/// Provider settings after CLI, config and environment are merged
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub name: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Resolve the wire protocol from explicit config, provider name, or base_url.
///
/// Explicit `kind` always wins. A custom base_url without a kind means an
/// OpenAI-compatible server; otherwise the provider name decides.
fn resolve_provider_kind(explicit: Option<ProviderKind>, name: &str, base_url: Option<&str>) -> ProviderKind {
    if let Some(kind) = explicit {
        return kind;
    }
    if base_url.is_some() {
        return ProviderKind::OpenAi;
    }
    match name.to_lowercase().as_str() {
        "anthropic" | "claude" => ProviderKind::Anthropic,
        "openrouter" => ProviderKind::OpenRouter,
        _ => ProviderKind::OpenAi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        Config::extract(Figment::from(Toml::string(toml))).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let config = parse(
            r#"
            default_provider = "claude"

            [providers.claude]
            kind = "anthropic"
            api_key = "sk-ant-test"
            default_model = "claude-sonnet-4-20250514"

            [providers.local]
            base_url = "http://localhost:8080/v1"

            [completion]
            system_prompt = "Be brief."
            max_tokens = 1024

            [session]
            id = "work"
        "#,
        );
        assert_eq!(config.default_provider.as_deref(), Some("claude"));
        assert_eq!(config.providers["claude"].kind, Some(ProviderKind::Anthropic));
        assert_eq!(config.completion.max_tokens, Some(1024));
        assert_eq!(config.session.id.as_deref(), Some("work"));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = parse("");
        assert!(config.providers.is_empty());
        assert!(config.default_provider.is_none());
    }

    #[test]
    fn test_resolve_default_provider_and_model_override() {
        let config = parse(
            r#"
            default_provider = "claude"

            [providers.claude]
            kind = "anthropic"
            api_key = "sk-ant-test"
            default_model = "claude-sonnet-4-20250514"
        "#,
        );
        let resolved = config.resolve_provider(None, None).unwrap();
        assert_eq!(resolved.name, "claude");
        assert_eq!(resolved.kind, ProviderKind::Anthropic);
        assert_eq!(resolved.api_key, "sk-ant-test");
        assert_eq!(resolved.model.as_deref(), Some("claude-sonnet-4-20250514"));

        let resolved = config.resolve_provider(None, Some("claude-opus")).unwrap();
        assert_eq!(resolved.model.as_deref(), Some("claude-opus"));
    }

    #[test]
    fn test_local_server_needs_no_key() {
        let config = parse(
            r#"
            [providers.turnstile-test-local]
            base_url = "http://localhost:11434/v1"
        "#,
        );
        let resolved = config
            .resolve_provider(Some("turnstile-test-local"), None)
            .unwrap();
        assert_eq!(resolved.kind, ProviderKind::OpenAi);
        assert!(resolved.api_key.is_empty());
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let config = parse(
            r#"
            [providers.turnstile-test-nokey]
            kind = "anthropic"
        "#,
        );
        let err = config
            .resolve_provider(Some("turnstile-test-nokey"), None)
            .unwrap_err();
        assert!(err.to_string().contains("TURNSTILE_TEST_NOKEY_API_KEY"));
    }

    #[test]
    fn test_resolve_provider_kind() {
        assert_eq!(
            resolve_provider_kind(Some(ProviderKind::Anthropic), "openai", Some("http://proxy")),
            ProviderKind::Anthropic
        );
        assert_eq!(
            resolve_provider_kind(None, "anthropic", Some("http://proxy")),
            ProviderKind::OpenAi
        );
        assert_eq!(resolve_provider_kind(None, "Claude", None), ProviderKind::Anthropic);
        assert_eq!(resolve_provider_kind(None, "openrouter", None), ProviderKind::OpenRouter);
        assert_eq!(resolve_provider_kind(None, "groq", None), ProviderKind::OpenAi);
    }

    #[test]
    fn test_completion_settings() {
        let config = parse(
            r#"
            [providers.openai]
            api_key = "sk"
            default_model = "gpt-4o"
            parameters = { reasoning_effort = "high" }

            [completion]
            system_prompt = "Configured."
            temperature = 0.5
        "#,
        );
        let provider = config.resolve_provider(Some("openai"), None).unwrap();

        let settings = config.completion_settings(&provider, None);
        assert_eq!(settings.model.as_deref(), Some("gpt-4o"));
        assert_eq!(settings.system_prompt.as_deref(), Some("Configured."));
        assert_eq!(settings.temperature, Some(0.5));
        assert_eq!(settings.extra["reasoning_effort"], "high");

        let settings = config.completion_settings(&provider, Some("Override."));
        assert_eq!(settings.system_prompt.as_deref(), Some("Override."));
    }
}
