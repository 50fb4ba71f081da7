mod dryrun;
mod gemini;

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use layerfit_contracts::image::InlineImage;
use thiserror::Error;

pub use dryrun::DryrunProvider;
pub use gemini::GeminiProvider;

#[derive(Clone, PartialEq, Eq)]
pub struct ImagePart {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl std::fmt::Debug for ImagePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePart")
            .field("media_type", &self.media_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl From<&InlineImage> for ImagePart {
    fn from(image: &InlineImage) -> Self {
        Self {
            bytes: image.data.clone(),
            media_type: image.media_type.clone(),
        }
    }
}

/// Sampling knobs shared by every adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Sampling {
    /// Most conservative setting the adapters expose. Used for synthesis,
    /// where drift from the reference images is the main failure mode.
    pub fn deterministic() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
        }
    }

    /// Low-temperature setting for the yes/no existence check.
    pub fn detection() -> Self {
        Self {
            temperature: 0.1,
            top_k: 10,
            top_p: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub images: Vec<ImagePart>,
    pub instruction: Option<String>,
    pub sampling: Sampling,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResponse {
    pub images: Vec<InlineImage>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

impl ProviderError {
    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate_text(body.trim(), 512);
        match status {
            429 => ProviderError::RateLimited(message),
            404 => ProviderError::ModelNotFound(message),
            400 => ProviderError::BadRequest(message),
            401 | 403 => ProviderError::MissingCredentials(message),
            _ => ProviderError::Server { status, message },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::ModelNotFound(_) => "model_not_found",
            ProviderError::BadRequest(_) => "bad_request",
            ProviderError::Server { .. } => "server",
            ProviderError::Timeout => "timeout",
            ProviderError::Transport(_) => "transport",
            ProviderError::MissingCredentials(_) => "missing_credentials",
        }
    }
}

/// External multi-image generation capability.
#[async_trait]
pub trait GenerationService: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn GenerationService>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: GenerationService + 'static>(&mut self, provider: P) {
        self.register_shared(Arc::new(provider));
    }

    pub fn register_shared(&mut self, provider: Arc<dyn GenerationService>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationService>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(GeminiProvider::new());
    registry
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_categories() {
        assert!(matches!(
            ProviderError::from_status(429, "slow down"),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_status(404, ""),
            ProviderError::ModelNotFound(_)
        ));
        assert!(matches!(
            ProviderError::from_status(400, ""),
            ProviderError::BadRequest(_)
        ));
        assert_eq!(
            ProviderError::from_status(503, "unavailable"),
            ProviderError::Server {
                status: 503,
                message: "unavailable".to_string()
            }
        );
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2048);
        let ProviderError::Server { message, .. } = ProviderError::from_status(500, &body) else {
            panic!("expected server error");
        };
        assert_eq!(message.chars().count(), 513);
        assert!(message.ends_with('…'));
    }

    #[test]
    fn default_registry_has_dryrun_and_gemini() {
        let registry = default_provider_registry();
        assert_eq!(registry.names(), vec!["dryrun", "gemini"]);
        assert!(registry.get("dryrun").is_some());
        assert!(registry.get("openai").is_none());
    }
}
