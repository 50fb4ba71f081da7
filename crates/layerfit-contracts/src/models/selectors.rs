use super::registry::{ModelRegistry, ModelSpec, Task};

/// Ordered candidate list for one task, plus notes on how it was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedCandidates {
    pub task: Task,
    pub candidates: Vec<ModelSpec>,
    pub requested: Vec<String>,
    pub skipped: Vec<String>,
    pub fallback_reason: Option<String>,
}

impl RankedCandidates {
    pub fn names(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|model| model.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Resolves requested model names into a ranked candidate list, keeping
    /// the requested order. Unknown or unsupported names are skipped with a
    /// note. When nothing usable was requested the task's default ranking is
    /// used, then any registered model supporting the task.
    pub fn rank(&self, requested: &[String], task: Task) -> Result<RankedCandidates, String> {
        let capability = task.capability();
        let mut candidates: Vec<ModelSpec> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        for name in requested {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if candidates.iter().any(|model| model.name == name) {
                continue;
            }
            match self.registry.ensure(name, capability) {
                Some(model) => candidates.push(model),
                None => skipped.push(format!(
                    "Requested model '{name}' unavailable for capability '{capability}'."
                )),
            }
        }

        let requested_names: Vec<String> = requested
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        if !candidates.is_empty() {
            return Ok(RankedCandidates {
                task,
                candidates,
                requested: requested_names,
                skipped,
                fallback_reason: None,
            });
        }

        let fallback_reason = if requested_names.is_empty() {
            "No models specified; using default ranking.".to_string()
        } else {
            format!("No requested model supports '{capability}'; using default ranking.")
        };

        let mut defaults: Vec<ModelSpec> = task
            .default_ranking()
            .iter()
            .filter_map(|name| self.registry.ensure(name, capability))
            .collect();
        if defaults.is_empty() {
            defaults = self.registry.by_capability(capability);
        }
        if defaults.is_empty() {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        }

        Ok(RankedCandidates {
            task,
            candidates: defaults,
            requested: requested_names,
            skipped,
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    fn model(name: &str, capabilities: &[&str]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: "dryrun".to_string(),
            capabilities: capabilities.iter().map(|item| item.to_string()).collect(),
        }
    }

    #[test]
    fn rank_keeps_requested_order_and_notes_skips() -> Result<(), String> {
        let selector = ModelSelector::new(None);
        let ranked = selector.rank(
            &[
                "gemini-2.5-pro".to_string(),
                "missing".to_string(),
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-pro".to_string(),
            ],
            Task::Compose,
        )?;
        assert_eq!(ranked.names(), vec!["gemini-2.5-pro", "gemini-2.5-flash"]);
        assert_eq!(
            ranked.skipped,
            vec!["Requested model 'missing' unavailable for capability 'compose'.".to_string()]
        );
        assert!(ranked.fallback_reason.is_none());
        Ok(())
    }

    #[test]
    fn rank_without_request_uses_task_default() -> Result<(), String> {
        let selector = ModelSelector::new(None);
        let ranked = selector.rank(&[], Task::Detect)?;
        assert_eq!(ranked.candidates[0].name, "gemini-2.5-flash");
        assert_eq!(
            ranked.fallback_reason.as_deref(),
            Some("No models specified; using default ranking.")
        );
        Ok(())
    }

    #[test]
    fn rank_falls_back_to_any_capable_model() -> Result<(), String> {
        let mut models = IndexMap::new();
        models.insert("local".to_string(), model("local", &["compose"]));
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(models))));
        let ranked = selector.rank(&["nope".to_string()], Task::Compose)?;
        assert_eq!(ranked.names(), vec!["local"]);
        assert_eq!(ranked.requested, vec!["nope"]);
        Ok(())
    }

    #[test]
    fn rank_errors_when_no_model_supports_task() {
        let mut models = IndexMap::new();
        models.insert("detector".to_string(), model("detector", &["detect"]));
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .rank(&[], Task::Compose)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for capability 'compose'.");
    }
}
