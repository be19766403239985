use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A remote capability the pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Vision,
    Text,
    Image,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Vision, Capability::Text, Capability::Image];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shape spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `POST {endpoint}/chat/completions`, OpenAI message schema.
    OpenAiChat,
    /// `POST {endpoint}/images/generations`, JSON body.
    OpenAiImages,
    /// `POST {endpoint}/images/edits`, multipart body for image-to-image.
    OpenAiImageEdits,
    /// Submit a task, then poll it, authenticated with a signed token.
    SignedTask,
    /// Offline deterministic responses.
    Dryrun,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAiChat => "openai-chat",
            Self::OpenAiImages => "openai-images",
            Self::OpenAiImageEdits => "openai-image-edits",
            Self::SignedTask => "signed-task",
            Self::Dryrun => "dryrun",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    Bearer(String),
    SignedKeyPair {
        access_key: String,
        secret_key: String,
    },
}

impl Credential {
    pub fn auth_style(&self) -> AuthStyle {
        match self {
            Self::None => AuthStyle::None,
            Self::Bearer(_) => AuthStyle::BearerKey,
            Self::SignedKeyPair { .. } => AuthStyle::SignedToken,
        }
    }

    /// True when every secret this credential needs is present.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bearer(key) => !key.trim().is_empty(),
            Self::SignedKeyPair {
                access_key,
                secret_key,
            } => !access_key.trim().is_empty() && !secret_key.trim().is_empty(),
        }
    }

    pub fn masked(&self) -> String {
        match self {
            Self::None => "<unset>".to_string(),
            Self::Bearer(key) => mask_secret(key),
            Self::SignedKeyPair {
                access_key,
                secret_key,
            } => format!("{} / {}", mask_secret(access_key), mask_secret(secret_key)),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.masked())
    }
}

/// How a route authenticates, as shown in the provider table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    None,
    BearerKey,
    SignedToken,
}

impl AuthStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BearerKey => "bearer",
            Self::SignedToken => "signed-token",
        }
    }
}

/// Everything needed to reach one capability: resolved once before a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRoute {
    pub provider: String,
    pub wire: WireFormat,
    pub endpoint: String,
    pub credential: Credential,
    pub model: String,
    pub timeout: Duration,
}

impl ProviderRoute {
    pub fn new(
        provider: impl Into<String>,
        wire: WireFormat,
        endpoint: impl Into<String>,
        credential: Credential,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            wire,
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            credential,
            model: model.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn auth_style(&self) -> AuthStyle {
        if self.wire == WireFormat::Dryrun {
            return AuthStyle::None;
        }
        self.credential.auth_style()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }
}

/// Capability-indexed provider configuration.
#[derive(Debug, Clone, Default)]
pub struct ProviderTable {
    routes: IndexMap<Capability, ProviderRoute>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: Capability, route: ProviderRoute) {
        self.routes.insert(capability, route);
    }

    pub fn with(mut self, capability: Capability, route: ProviderRoute) -> Self {
        self.insert(capability, route);
        self
    }

    pub fn get(&self, capability: Capability) -> Option<&ProviderRoute> {
        self.routes.get(&capability)
    }

    pub fn routes(&self) -> impl Iterator<Item = (Capability, &ProviderRoute)> {
        self.routes.iter().map(|(capability, route)| (*capability, route))
    }
}

fn mask_secret(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let count = trimmed.chars().count();
    if count <= 8 {
        return "*".repeat(count);
    }
    let head: String = trimmed.chars().take(4).collect();
    let tail: String = trimmed.chars().skip(count - 2).collect();
    format!("{head}…{tail}")
}
