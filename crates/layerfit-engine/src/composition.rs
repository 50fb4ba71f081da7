use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layerfit_contracts::image::{
    first_usable_image_url, is_inaccessible_url, HandleStore, ImageRef, InlineImage,
};
use layerfit_contracts::layers::SlotPosition;
use layerfit_contracts::models::ModelSpec;
use layerfit_contracts::session::SessionState;
use thiserror::Error;

use crate::codec::{resolve_image, ImageFetcher};
use crate::fallback::{run_candidates, Attempt, FallbackOutcome, ResponseInterpreter, Verdict};
use crate::provider::{
    GenerationRequest, GenerationResponse, ImagePart, ProviderRegistry, Sampling,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("upload a photo before composing an outfit")]
    MissingBaseImage,

    #[error("the base photo is no longer available: {0}")]
    BaseImageUnavailable(String),

    #[error("no garments to put on; add or restore at least one layer")]
    NoGarments,

    #[error("outfit generation failed on every model ({last_reason})")]
    Exhausted { last_reason: String },
}

/// A ready-to-send synthesis request and the slots it carries, in the
/// order their images follow the base photo.
#[derive(Debug, Clone)]
pub struct CompositionPlan {
    pub request: GenerationRequest,
    pub layers: Vec<SlotPosition>,
}

#[derive(Debug, Clone)]
pub struct Composition {
    pub image: InlineImage,
    pub model: String,
    pub layers: Vec<SlotPosition>,
    pub attempts: Vec<Attempt>,
}

pub fn composition_instruction(layers: &[SlotPosition], prompt: &str) -> String {
    let mut lines = vec![
        "Image 1 is the identity reference and must stay unchanged: keep the face, body shape, \
         pose, skin tone, hairstyle and background exactly as shown."
            .to_string(),
        format!(
            "Images 2 to {} are garment references only. Ignore any person, mannequin or \
             background that appears in them.",
            layers.len() + 1
        ),
        "Dress the person from image 1 in the garments below, worn from innermost to outermost:"
            .to_string(),
    ];
    for (offset, position) in layers.iter().enumerate() {
        lines.push(format!(
            "- Image {}: {} ({position})",
            offset + 2,
            position.layer_name()
        ));
    }
    lines.push(
        "Each later garment is worn over the earlier ones. Return one photorealistic image."
            .to_string(),
    );
    let prompt = prompt.trim();
    if !prompt.is_empty() {
        lines.push(format!("Additional request: {prompt}"));
    }
    lines.join("\n")
}

struct CompositionInterpreter {
    fetcher: Arc<dyn ImageFetcher>,
}

#[async_trait]
impl ResponseInterpreter for CompositionInterpreter {
    type Output = InlineImage;

    async fn interpret(&self, response: GenerationResponse) -> Verdict<InlineImage> {
        if let Some(image) = response.images.into_iter().find(InlineImage::is_image) {
            return Verdict::Accept(image);
        }
        if let Some(url) = first_usable_image_url(&response.text) {
            return match self.fetcher.fetch(&url).await {
                Ok(image) => Verdict::Accept(image),
                Err(err) => Verdict::Advance(format!("result url could not be fetched: {err:#}")),
            };
        }
        Verdict::Advance("response carried no image".to_string())
    }
}

pub struct Composer {
    providers: Arc<ProviderRegistry>,
    fetcher: Arc<dyn ImageFetcher>,
    handles: HandleStore,
    candidates: Vec<ModelSpec>,
    timeout: Duration,
}

impl Composer {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        fetcher: Arc<dyn ImageFetcher>,
        handles: HandleStore,
        candidates: Vec<ModelSpec>,
        timeout: Duration,
    ) -> Self {
        Self {
            providers,
            fetcher,
            handles,
            candidates,
            timeout,
        }
    }

    /// Builds the request without contacting any model. Garments whose
    /// source is unreachable are left out with a warning.
    pub async fn plan(&self, state: &SessionState) -> Result<CompositionPlan, ComposeError> {
        let base = state
            .base_image
            .as_ref()
            .ok_or(ComposeError::MissingBaseImage)?;
        let outfit = state.effective_outfit();
        if outfit.is_empty() {
            return Err(ComposeError::NoGarments);
        }
        let base = resolve_image(base, &self.handles, self.fetcher.as_ref())
            .await
            .map_err(|err| ComposeError::BaseImageUnavailable(err.to_string()))?;

        let mut images = vec![ImagePart::from(&base)];
        let mut layers = Vec::new();
        for (position, image) in outfit.layered() {
            if let ImageRef::RemoteUrl(url) = image {
                if is_inaccessible_url(url) {
                    tracing::warn!(slot = %position, %url, "garment url is inaccessible; slot skipped");
                    continue;
                }
            }
            match resolve_image(image, &self.handles, self.fetcher.as_ref()).await {
                Ok(inline) => {
                    images.push(ImagePart::from(&inline));
                    layers.push(position);
                }
                Err(err) => {
                    tracing::warn!(slot = %position, error = %err, "garment unavailable; slot skipped");
                }
            }
        }
        if layers.is_empty() {
            return Err(ComposeError::NoGarments);
        }

        Ok(CompositionPlan {
            request: GenerationRequest {
                images,
                instruction: Some(composition_instruction(&layers, &state.prompt)),
                sampling: Sampling::deterministic(),
            },
            layers,
        })
    }

    pub async fn compose(&self, state: &SessionState) -> Result<Composition, ComposeError> {
        let plan = self.plan(state).await?;
        let interpreter = CompositionInterpreter {
            fetcher: self.fetcher.clone(),
        };
        match run_candidates(
            &self.providers,
            &self.candidates,
            &plan.request,
            self.timeout,
            &interpreter,
        )
        .await
        {
            FallbackOutcome::Accepted {
                value,
                model,
                attempts,
            } => Ok(Composition {
                image: value,
                model,
                layers: plan.layers,
                attempts,
            }),
            FallbackOutcome::Exhausted { last_reason, .. } => {
                Err(ComposeError::Exhausted { last_reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use layerfit_contracts::layers::Category;

    use super::*;
    use crate::testing::{sample_png, MapFetcher, Scripted, ScriptedService};

    fn composer(service: &ScriptedService, fetcher: MapFetcher, handles: HandleStore) -> Composer {
        let mut providers = ProviderRegistry::new();
        providers.register(service.clone());
        let candidates = ["first", "second"]
            .iter()
            .map(|name| ModelSpec {
                name: name.to_string(),
                provider: "scripted".to_string(),
                capabilities: vec!["compose".to_string()],
            })
            .collect();
        Composer::new(
            Arc::new(providers),
            Arc::new(fetcher),
            handles,
            candidates,
            Duration::from_secs(90),
        )
    }

    fn dressed_state(handles: &HandleStore) -> anyhow::Result<SessionState> {
        let mut state = SessionState::new();
        state.replace_base_image(handles.insert(sample_png(1)));
        state
            .baseline_outfit
            .set(
                SlotPosition::new(Category::Outer, 1),
                Some(ImageRef::InlineData(sample_png(10))),
            )
            .map_err(anyhow::Error::msg)?;
        state
            .baseline_outfit
            .set(
                SlotPosition::new(Category::Bottoms, 0),
                Some(ImageRef::InlineData(sample_png(20))),
            )
            .map_err(anyhow::Error::msg)?;
        state
            .baseline_outfit
            .set(
                SlotPosition::new(Category::Inner, 2),
                Some(ImageRef::InlineData(sample_png(30))),
            )
            .map_err(anyhow::Error::msg)?;
        state
            .user_slots
            .set(
                SlotPosition::new(Category::Inner, 1),
                Some(handles.insert(sample_png(40))),
            )
            .map_err(anyhow::Error::msg)?;
        Ok(state)
    }

    #[tokio::test]
    async fn request_follows_layer_order_after_base() -> anyhow::Result<()> {
        let handles = HandleStore::new();
        let service = ScriptedService::default();
        service.push("first", Scripted::image(sample_png(99)));
        let composer = composer(&service, MapFetcher::default(), handles.clone());
        let mut state = dressed_state(&handles)?;
        state.prompt = "  roll up the sleeves ".to_string();

        let composition = composer.compose(&state).await?;
        assert_eq!(composition.image, sample_png(99));
        assert_eq!(composition.model, "first");
        assert_eq!(
            composition.layers,
            vec![
                SlotPosition::new(Category::Bottoms, 0),
                SlotPosition::new(Category::Inner, 2),
                SlotPosition::new(Category::Inner, 1),
                SlotPosition::new(Category::Outer, 1),
            ]
        );

        let sent = &service.requests()[0];
        let shades: Vec<Vec<u8>> = sent.images.iter().map(|part| part.bytes.clone()).collect();
        let expected: Vec<Vec<u8>> = [1, 20, 30, 40, 10]
            .into_iter()
            .map(|shade| sample_png(shade).data)
            .collect();
        assert_eq!(shades, expected);
        assert_eq!(sent.sampling, Sampling::deterministic());
        let instruction = sent.instruction.clone().unwrap_or_default();
        assert!(instruction.contains("- Image 2: bottoms layer 1 (bottoms[0])"));
        assert!(instruction.contains("- Image 5: light outer (outer[1])"));
        assert!(instruction.ends_with("Additional request: roll up the sleeves"));
        Ok(())
    }

    #[test]
    fn instruction_omits_empty_prompt() {
        let text = composition_instruction(&[SlotPosition::new(Category::Outer, 0)], "   ");
        assert!(!text.contains("Additional request"));
        assert!(text.contains("Images 2 to 2"));
    }

    #[tokio::test]
    async fn preconditions_fail_before_any_call() -> anyhow::Result<()> {
        let handles = HandleStore::new();
        let service = ScriptedService::default();
        let composer = composer(&service, MapFetcher::default(), handles.clone());

        let empty = SessionState::new();
        assert_eq!(
            composer.compose(&empty).await.err(),
            Some(ComposeError::MissingBaseImage)
        );

        let mut bare = SessionState::new();
        bare.replace_base_image(handles.insert(sample_png(1)));
        assert_eq!(
            composer.compose(&bare).await.err(),
            Some(ComposeError::NoGarments)
        );
        assert!(service.contacts().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_garments_are_nulled_not_fatal() -> anyhow::Result<()> {
        let handles = HandleStore::new();
        let service = ScriptedService::default();
        service.push("first", Scripted::image(sample_png(99)));
        let composer = composer(&service, MapFetcher::default(), handles.clone());

        let mut state = SessionState::new();
        state.replace_base_image(handles.insert(sample_png(1)));
        state
            .user_slots
            .set(
                SlotPosition::new(Category::Outer, 0),
                Some(ImageRef::RemoteUrl(
                    "https://file-cdn.flyai.com/coat.png".to_string(),
                )),
            )
            .map_err(anyhow::Error::msg)?;
        state
            .user_slots
            .set(
                SlotPosition::new(Category::Outer, 1),
                Some(ImageRef::RemoteUrl("https://cdn.test/gone.png".to_string())),
            )
            .map_err(anyhow::Error::msg)?;
        state
            .user_slots
            .set(
                SlotPosition::new(Category::Bottoms, 0),
                Some(ImageRef::InlineData(sample_png(5))),
            )
            .map_err(anyhow::Error::msg)?;

        let plan = composer.plan(&state).await?;
        assert_eq!(plan.layers, vec![SlotPosition::new(Category::Bottoms, 0)]);
        assert_eq!(plan.request.images.len(), 2);

        state.user_slots.bottoms[0] = None;
        assert_eq!(
            composer.plan(&state).await.err(),
            Some(ComposeError::NoGarments)
        );
        Ok(())
    }

    #[tokio::test]
    async fn all_candidates_rate_limited_is_exhaustion() -> anyhow::Result<()> {
        let handles = HandleStore::new();
        let service = ScriptedService::default();
        service
            .always("first", Scripted::rate_limited())
            .always("second", Scripted::rate_limited());
        let composer = composer(&service, MapFetcher::default(), handles.clone());

        let err = composer.compose(&dressed_state(&handles)?).await.err();
        assert_eq!(
            err,
            Some(ComposeError::Exhausted {
                last_reason: "second: rate limited: quota".to_string()
            })
        );
        assert_eq!(service.contacts(), vec!["first", "second"]);
        Ok(())
    }

    #[tokio::test]
    async fn unfetchable_result_url_advances() -> anyhow::Result<()> {
        let handles = HandleStore::new();
        let service = ScriptedService::default();
        let result = sample_png(77);
        service
            .push("first", Scripted::text("Here: https://cdn.test/expired.png"))
            .push("second", Scripted::text("Done https://cdn.test/result.png"));
        let fetcher = MapFetcher::default().with("https://cdn.test/result.png", result.clone());
        let composer = composer(&service, fetcher, handles.clone());

        let composition = composer.compose(&dressed_state(&handles)?).await?;
        assert_eq!(composition.image, result);
        assert_eq!(composition.model, "second");
        assert!(composition.attempts[0]
            .detail
            .starts_with("result url could not be fetched"));
        Ok(())
    }
}
