use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    /// Models from `provider` that support `capability`, in registration order.
    pub fn by_provider(&self, provider: &str, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider && model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, provider: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.provider == provider && model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("dryrun-vision-1", "dryrun", &["vision"]);
    insert("dryrun-text-1", "dryrun", &["text"]);
    insert("dryrun-image-1", "dryrun", &["image"]);
    insert("deepseek-chat", "deepseek", &["text"]);
    insert("deepseek-reasoner", "deepseek", &["text"]);
    insert("Qwen/Qwen2.5-VL-72B-Instruct", "siliconflow", &["vision", "text"]);
    insert("Qwen/Qwen2.5-72B-Instruct", "siliconflow", &["text"]);
    insert("Kwai-Kolors/Kolors", "siliconflow", &["image"]);
    insert("black-forest-labs/FLUX.1-schnell", "siliconflow", &["image"]);
    insert("gpt-4o-mini", "openai", &["vision", "text"]);
    insert("gpt-4o", "openai", &["vision", "text"]);
    insert("gpt-image-1", "openai", &["image"]);
    insert("dall-e-3", "openai", &["image"]);
    insert("kling-v1-5", "kling", &["image"]);
    insert("kling-v1", "kling", &["image"]);

    map
}
