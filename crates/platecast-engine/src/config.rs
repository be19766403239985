use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use platecast_contracts::models::ModelSelector;
use platecast_contracts::providers::{
    Capability, Credential, ProviderRoute, ProviderTable, WireFormat, DEFAULT_REQUEST_TIMEOUT,
};
use serde::Deserialize;

pub const DEFAULT_SECRETS_PATH: &str = ".streamlit/secrets.toml";
pub const PASSWORD_ENV: &str = "PLATECAST_PASSWORD";

const ENV_KEYS: [&str; 10] = [
    "DEEPSEEK_API_KEY",
    "DEEPSEEK_API_BASE",
    "SILICONFLOW_API_KEY",
    "SILICONFLOW_API_BASE",
    "OPENAI_API_KEY",
    "OPENAI_API_BASE",
    "KLING_ACCESS_KEY",
    "KLING_SECRET_KEY",
    "KLING_API_BASE",
    PASSWORD_ENV,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    DeepSeek,
    SiliconFlow,
    OpenAi,
    Kling,
    Dryrun,
}

impl Vendor {
    pub const ALL: [Vendor; 5] = [
        Vendor::DeepSeek,
        Vendor::SiliconFlow,
        Vendor::OpenAi,
        Vendor::Kling,
        Vendor::Dryrun,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeepSeek => "deepseek",
            Self::SiliconFlow => "siliconflow",
            Self::OpenAi => "openai",
            Self::Kling => "kling",
            Self::Dryrun => "dryrun",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::DeepSeek => "https://api.deepseek.com",
            Self::SiliconFlow => "https://api.siliconflow.cn/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Kling => "https://api.klingai.com",
            Self::Dryrun => "",
        }
    }

    /// Wire format this vendor speaks for a capability, if it offers it.
    pub fn wire_for(self, capability: Capability) -> Option<WireFormat> {
        match (self, capability) {
            (Self::Dryrun, _) => Some(WireFormat::Dryrun),
            (Self::DeepSeek, Capability::Text) => Some(WireFormat::OpenAiChat),
            (Self::SiliconFlow | Self::OpenAi, Capability::Vision | Capability::Text) => {
                Some(WireFormat::OpenAiChat)
            }
            (Self::SiliconFlow, Capability::Image) => Some(WireFormat::OpenAiImages),
            (Self::OpenAi, Capability::Image) => Some(WireFormat::OpenAiImageEdits),
            (Self::Kling, Capability::Image) => Some(WireFormat::SignedTask),
            _ => None,
        }
    }

    pub fn serving(capability: Capability) -> Vec<Vendor> {
        Self::ALL
            .into_iter()
            .filter(|vendor| vendor.wire_for(capability).is_some())
            .collect()
    }

    fn base_env(self) -> Option<&'static str> {
        match self {
            Self::DeepSeek => Some("DEEPSEEK_API_BASE"),
            Self::SiliconFlow => Some("SILICONFLOW_API_BASE"),
            Self::OpenAi => Some("OPENAI_API_BASE"),
            Self::Kling => Some("KLING_API_BASE"),
            Self::Dryrun => None,
        }
    }

    fn credential_hint(self) -> &'static str {
        match self {
            Self::DeepSeek => "DEEPSEEK_API_KEY or [deepseek] api_key",
            Self::SiliconFlow => "SILICONFLOW_API_KEY or [siliconflow] api_key",
            Self::OpenAi => "OPENAI_API_KEY or [openai] api_key",
            Self::Kling => "KLING_ACCESS_KEY/KLING_SECRET_KEY or [kling] access_key/secret_key",
            Self::Dryrun => "nothing",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|vendor| vendor.as_str() == key)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|vendor| vendor.as_str()).collect();
                format!("unknown vendor '{key}' (expected one of: {})", names.join(", "))
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeySection {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignedKeySection {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub password: Option<String>,
}

/// `secrets.toml` layout. Unknown tables are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretsFile {
    #[serde(default)]
    pub deepseek: KeySection,
    #[serde(default)]
    pub siliconflow: KeySection,
    #[serde(default)]
    pub openai: KeySection,
    #[serde(default)]
    pub kling: SignedKeySection,
    #[serde(default)]
    pub app: AppSection,
}

impl SecretsFile {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("secrets file is not valid TOML")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading secrets file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("in {}", path.display()))
    }

    fn key_section(&self, vendor: Vendor) -> Option<&KeySection> {
        match vendor {
            Vendor::DeepSeek => Some(&self.deepseek),
            Vendor::SiliconFlow => Some(&self.siliconflow),
            Vendor::OpenAi => Some(&self.openai),
            Vendor::Kling | Vendor::Dryrun => None,
        }
    }
}

/// Snapshot of the environment variables and secrets file a run reads.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    env: IndexMap<String, String>,
    secrets: SecretsFile,
    secrets_path: Option<PathBuf>,
}

impl ConfigSources {
    pub fn new(env: IndexMap<String, String>, secrets: SecretsFile) -> Self {
        Self {
            env: env
                .into_iter()
                .filter_map(|(key, value)| {
                    let value = value.trim().to_string();
                    (!value.is_empty()).then_some((key, value))
                })
                .collect(),
            secrets,
            secrets_path: None,
        }
    }

    /// Reads the process environment plus a secrets file. An explicit path
    /// must exist; the default path is only used when present.
    pub fn load(secrets_path: Option<&Path>) -> Result<Self> {
        let env = ENV_KEYS
            .iter()
            .filter_map(|key| non_empty_env(key).map(|value| (key.to_string(), value)))
            .collect();
        let (secrets, path) = match secrets_path {
            Some(path) => (SecretsFile::load(path)?, Some(path.to_path_buf())),
            None => {
                let default = PathBuf::from(DEFAULT_SECRETS_PATH);
                if default.is_file() {
                    (SecretsFile::load(&default)?, Some(default))
                } else {
                    (SecretsFile::default(), None)
                }
            }
        };
        let mut sources = Self::new(env, secrets);
        sources.secrets_path = path;
        Ok(sources)
    }

    pub fn secrets_path(&self) -> Option<&Path> {
        self.secrets_path.as_deref()
    }

    fn env(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    /// Shared secret for the access gate, if one is configured.
    pub fn password(&self) -> Option<String> {
        self.env(PASSWORD_ENV).or_else(|| non_blank(&self.secrets.app.password))
    }

    pub fn endpoint(&self, vendor: Vendor) -> String {
        let from_file = match vendor {
            Vendor::Kling => non_blank(&self.secrets.kling.api_base),
            other => self
                .secrets
                .key_section(other)
                .and_then(|section| non_blank(&section.api_base)),
        };
        vendor
            .base_env()
            .and_then(|key| self.env(key))
            .or(from_file)
            .unwrap_or_else(|| vendor.default_endpoint().to_string())
            .trim()
            .trim_end_matches('/')
            .to_string()
    }

    /// Environment wins over the secrets file, field by field.
    pub fn credential(&self, vendor: Vendor) -> Credential {
        match vendor {
            Vendor::Dryrun => Credential::None,
            Vendor::Kling => Credential::SignedKeyPair {
                access_key: self
                    .env("KLING_ACCESS_KEY")
                    .or_else(|| non_blank(&self.secrets.kling.access_key))
                    .unwrap_or_default(),
                secret_key: self
                    .env("KLING_SECRET_KEY")
                    .or_else(|| non_blank(&self.secrets.kling.secret_key))
                    .unwrap_or_default(),
            },
            other => {
                let env_key = match other {
                    Vendor::DeepSeek => "DEEPSEEK_API_KEY",
                    Vendor::SiliconFlow => "SILICONFLOW_API_KEY",
                    _ => "OPENAI_API_KEY",
                };
                let key = self
                    .env(env_key)
                    .or_else(|| {
                        self.secrets
                            .key_section(other)
                            .and_then(|section| non_blank(&section.api_key))
                    })
                    .unwrap_or_default();
                Credential::Bearer(key)
            }
        }
    }
}

/// Which vendor and model serve each capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorSelection {
    pub vision: Vendor,
    pub text: Vendor,
    pub image: Vendor,
    pub vision_model: Option<String>,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub timeout: Duration,
}

impl Default for VendorSelection {
    fn default() -> Self {
        Self {
            vision: Vendor::SiliconFlow,
            text: Vendor::DeepSeek,
            image: Vendor::SiliconFlow,
            vision_model: None,
            text_model: None,
            image_model: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl VendorSelection {
    /// Every capability served offline.
    pub fn dryrun() -> Self {
        Self {
            vision: Vendor::Dryrun,
            text: Vendor::Dryrun,
            image: Vendor::Dryrun,
            ..Self::default()
        }
    }

    fn pick(&self, capability: Capability) -> (Vendor, Option<&str>) {
        match capability {
            Capability::Vision => (self.vision, self.vision_model.as_deref()),
            Capability::Text => (self.text, self.text_model.as_deref()),
            Capability::Image => (self.image, self.image_model.as_deref()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub table: ProviderTable,
    /// Model fallbacks and missing credentials, for display before a run.
    pub notes: Vec<String>,
}

/// Builds the capability table once, before any pipeline work. Missing
/// credentials are noted here and surface as per-item config errors later.
pub fn resolve(selection: &VendorSelection, sources: &ConfigSources) -> Result<ResolvedConfig> {
    let timeout = validate_timeout(selection.timeout)?;
    let selector = ModelSelector::new(None);
    let mut table = ProviderTable::new();
    let mut notes = Vec::new();

    for capability in Capability::ALL {
        let (vendor, requested) = selection.pick(capability);
        let wire = vendor.wire_for(capability).ok_or_else(|| {
            let options: Vec<&str> = Vendor::serving(capability)
                .iter()
                .map(|vendor| vendor.as_str())
                .collect();
            anyhow!(
                "{vendor} does not offer {capability}; choose one of: {}",
                options.join(", ")
            )
        })?;
        let chosen = selector
            .select(vendor.as_str(), requested, capability.as_str())
            .map_err(|message| anyhow!(message))?;
        if requested.is_some() {
            if let Some(reason) = &chosen.fallback_reason {
                notes.push(format!("{capability}: {reason} Using '{}'.", chosen.model.name));
            }
        }

        let credential = sources.credential(vendor);
        if vendor != Vendor::Dryrun && !credential.is_complete() {
            notes.push(format!(
                "{capability}: no credential for {vendor}; set {}",
                vendor.credential_hint()
            ));
        }
        let route = ProviderRoute::new(
            vendor.as_str(),
            wire,
            sources.endpoint(vendor),
            credential,
            chosen.model.name,
        )
        .with_timeout(timeout);
        table.insert(capability, route);
    }

    Ok(ResolvedConfig { table, notes })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn validate_timeout(timeout: Duration) -> Result<Duration> {
    if timeout.is_zero() {
        bail!("request timeout must be greater than zero");
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    const SECRETS: &str = r#"
[deepseek]
api_key = "sk-file-deepseek"

[siliconflow]
api_key = "sk-file-silicon"
api_base = "https://proxy.example.com/v1/"

[kling]
access_key = "ak-file"
secret_key = "sk-file"

[app]
password = "open-sesame"

[unrelated]
value = 1
"#;

    #[test]
    fn default_selection_resolves_from_secrets_file() -> Result<()> {
        let sources = ConfigSources::new(IndexMap::new(), SecretsFile::parse(SECRETS)?);
        let resolved = resolve(&VendorSelection::default(), &sources)?;

        let vision = resolved.table.get(Capability::Vision).unwrap();
        assert_eq!(vision.provider, "siliconflow");
        assert_eq!(vision.wire, WireFormat::OpenAiChat);
        assert_eq!(vision.endpoint, "https://proxy.example.com/v1");
        assert_eq!(vision.model, "Qwen/Qwen2.5-VL-72B-Instruct");
        assert_eq!(vision.credential, Credential::Bearer("sk-file-silicon".to_string()));

        let text = resolved.table.get(Capability::Text).unwrap();
        assert_eq!(text.endpoint, "https://api.deepseek.com");
        assert_eq!(text.model, "deepseek-chat");

        let image = resolved.table.get(Capability::Image).unwrap();
        assert_eq!(image.wire, WireFormat::OpenAiImages);
        assert_eq!(image.model, "Kwai-Kolors/Kolors");
        assert!(resolved.notes.is_empty());
        assert_eq!(sources.password().as_deref(), Some("open-sesame"));
        Ok(())
    }

    #[test]
    fn environment_wins_over_file() -> Result<()> {
        let sources = ConfigSources::new(
            env(&[
                ("DEEPSEEK_API_KEY", " sk-env "),
                ("KLING_SECRET_KEY", "sk-env-kling"),
                ("SILICONFLOW_API_BASE", "https://env.example.com/v1/"),
                ("PLATECAST_PASSWORD", "from-env"),
            ]),
            SecretsFile::parse(SECRETS)?,
        );
        assert_eq!(
            sources.credential(Vendor::DeepSeek),
            Credential::Bearer("sk-env".to_string())
        );
        assert_eq!(
            sources.credential(Vendor::Kling),
            Credential::SignedKeyPair {
                access_key: "ak-file".to_string(),
                secret_key: "sk-env-kling".to_string(),
            }
        );
        assert_eq!(sources.endpoint(Vendor::SiliconFlow), "https://env.example.com/v1");
        assert_eq!(sources.password().as_deref(), Some("from-env"));
        Ok(())
    }

    #[test]
    fn missing_credentials_are_noted_not_fatal() -> Result<()> {
        let selection = VendorSelection {
            image: Vendor::Kling,
            ..VendorSelection::default()
        };
        let resolved = resolve(&selection, &ConfigSources::default())?;
        assert_eq!(resolved.notes.len(), 3);
        assert!(resolved.notes[2].starts_with("image: no credential for kling"));
        let image = resolved.table.get(Capability::Image).unwrap();
        assert_eq!(image.wire, WireFormat::SignedTask);
        assert_eq!(image.model, "kling-v1-5");
        assert!(!image.credential.is_complete());
        Ok(())
    }

    #[test]
    fn vendor_without_capability_is_rejected() {
        let selection = VendorSelection {
            vision: Vendor::DeepSeek,
            ..VendorSelection::default()
        };
        let err = resolve(&selection, &ConfigSources::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "deepseek does not offer vision; choose one of: siliconflow, openai, dryrun"
        );
    }

    #[test]
    fn unknown_model_falls_back_with_a_note() -> Result<()> {
        let selection = VendorSelection {
            vision: Vendor::Dryrun,
            text_model: Some("deepseek-v9".to_string()),
            image_model: Some("stabilityai/sdxl-custom".to_string()),
            ..VendorSelection::default()
        };
        let resolved = resolve(&selection, &ConfigSources::default())?;
        assert_eq!(resolved.table.get(Capability::Text).unwrap().model, "deepseek-chat");
        assert_eq!(
            resolved.table.get(Capability::Image).unwrap().model,
            "stabilityai/sdxl-custom"
        );
        assert!(resolved.notes.iter().any(|note| note
            == "text: Requested model 'deepseek-v9' unavailable from 'deepseek' for capability 'text'. Using 'deepseek-chat'."));
        Ok(())
    }

    #[test]
    fn dryrun_needs_no_credentials() -> Result<()> {
        let resolved = resolve(&VendorSelection::dryrun(), &ConfigSources::default())?;
        assert!(resolved.notes.is_empty());
        assert!(resolved
            .table
            .routes()
            .all(|(_, route)| route.wire == WireFormat::Dryrun));
        Ok(())
    }

    #[test]
    fn secrets_file_errors_carry_the_path() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("secrets.toml");
        fs::write(&path, "[deepseek\napi_key = 1")?;
        let err = SecretsFile::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("secrets.toml"));
        assert!(SecretsFile::load(&temp.path().join("absent.toml")).is_err());
        Ok(())
    }

    #[test]
    fn vendor_names_parse() {
        assert_eq!("SiliconFlow".parse::<Vendor>(), Ok(Vendor::SiliconFlow));
        assert!("midjourney".parse::<Vendor>().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let selection = VendorSelection {
            timeout: Duration::ZERO,
            ..VendorSelection::dryrun()
        };
        assert!(resolve(&selection, &ConfigSources::default()).is_err());
    }
}
