use std::fmt;

use indexmap::IndexMap;

/// What a candidate model is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Existence check plus garment extraction from a photo.
    Detect,
    /// Multi-image outfit synthesis.
    Compose,
}

impl Task {
    pub fn capability(self) -> &'static str {
        match self {
            Task::Detect => "detect",
            Task::Compose => "compose",
        }
    }

    /// Default ranking for the task. Detection prefers text-capable models
    /// for the yes/no answer; composition prefers image generators.
    pub fn default_ranking(self) -> &'static [&'static str] {
        match self {
            Task::Detect => &[
                "gemini-2.5-flash",
                "gemini-2.5-pro",
                "gemini-3-pro-preview",
                "gemini-3-flash-preview",
                "gemini-3-pro-image-preview",
                "gemini-2.0-flash-exp-image-generation",
                "gemini-2.5-flash-image",
                "nano-banana-pro-preview",
            ],
            Task::Compose => &[
                "gemini-3-pro-image-preview",
                "gemini-3-flash-preview",
                "gemini-3-pro-preview",
                "gemini-2.0-flash-exp-image-generation",
                "gemini-2.5-flash-image",
                "nano-banana-pro-preview",
                "gemini-2.5-flash",
                "gemini-2.5-pro",
            ],
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.capability())
    }
}

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

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
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

    insert("gemini-3-pro-image-preview", "gemini", &["detect", "compose"]);
    insert("gemini-3-flash-preview", "gemini", &["detect", "compose"]);
    insert("gemini-3-pro-preview", "gemini", &["detect", "compose"]);
    insert(
        "gemini-2.0-flash-exp-image-generation",
        "gemini",
        &["detect", "compose"],
    );
    insert("gemini-2.5-flash-image", "gemini", &["detect", "compose"]);
    insert("nano-banana-pro-preview", "gemini", &["detect", "compose"]);
    insert("gemini-2.5-flash", "gemini", &["detect", "compose"]);
    insert("gemini-2.5-pro", "gemini", &["detect", "compose"]);
    insert("dryrun-vision-1", "dryrun", &["detect", "compose"]);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rankings_resolve_against_default_registry() {
        let registry = ModelRegistry::new(None);
        for task in [Task::Detect, Task::Compose] {
            for name in task.default_ranking() {
                assert!(
                    registry.ensure(name, task.capability()).is_some(),
                    "{name} missing for {task}"
                );
            }
        }
    }

    #[test]
    fn detect_ranking_starts_with_text_models() {
        assert_eq!(Task::Detect.default_ranking()[0], "gemini-2.5-flash");
        assert_eq!(Task::Compose.default_ranking()[0], "gemini-3-pro-image-preview");
    }

    #[test]
    fn ensure_rejects_unsupported_capability() {
        let mut models = IndexMap::new();
        models.insert(
            "describe-only".to_string(),
            ModelSpec {
                name: "describe-only".to_string(),
                provider: "dryrun".to_string(),
                capabilities: vec!["detect".to_string()],
            },
        );
        let registry = ModelRegistry::new(Some(models));
        assert!(registry.ensure("describe-only", "detect").is_some());
        assert!(registry.ensure("describe-only", "compose").is_none());
        assert!(registry.ensure("missing", "detect").is_none());
    }
}
