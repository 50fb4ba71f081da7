use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layerfit_contracts::image::{first_usable_image_url, ImageRef, InlineImage};
use layerfit_contracts::layers::{Category, SlotPosition};
use layerfit_contracts::models::ModelSpec;
use layerfit_contracts::session::Outfit;

use crate::codec::ImageFetcher;
use crate::fallback::{run_candidates, Attempt, FallbackOutcome, ResponseInterpreter, Verdict};
use crate::provider::{
    GenerationRequest, GenerationResponse, ImagePart, ProviderRegistry, Sampling,
};

/// A garment layer the detector asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GarmentSlot {
    pub key: &'static str,
    pub position: SlotPosition,
    pub description: &'static str,
}

/// Slots checked on every upload, outermost first. `bottoms[1]` is left
/// for the user to fill.
pub const GARMENT_SLOTS: [GarmentSlot; 6] = [
    GarmentSlot {
        key: "heavy-outer",
        position: SlotPosition::new(Category::Outer, 0),
        description: "heavy outerwear: coats, padded or down jackets, shearling, long coats",
    },
    GarmentSlot {
        key: "light-outer",
        position: SlotPosition::new(Category::Outer, 1),
        description: "light outerwear: blazers, jackets, bombers, denim or leather jackets",
    },
    GarmentSlot {
        key: "mid-layer",
        position: SlotPosition::new(Category::Inner, 0),
        description: "mid layer: cardigans, zip-ups, zip hoodies",
    },
    GarmentSlot {
        key: "main-top",
        position: SlotPosition::new(Category::Inner, 1),
        description: "main top: knits, sweaters, hoodies, sweatshirts, vests",
    },
    GarmentSlot {
        key: "base-inner",
        position: SlotPosition::new(Category::Inner, 2),
        description: "base layer: t-shirts, shirts, turtlenecks, long or short sleeve tees",
    },
    GarmentSlot {
        key: "bottoms",
        position: SlotPosition::new(Category::Bottoms, 0),
        description: "bottoms: trousers, jeans, slacks, skirts, shorts",
    },
];

const NEGATIVE_PHRASES: &[&str] = &["not found", "not_found", "없음", "감지되지 않", "없습니다"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    Found(ImageRef),
    NotPresent,
    Failed(String),
}

impl DetectionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DetectionOutcome::Found(_) => "found",
            DetectionOutcome::NotPresent => "not_present",
            DetectionOutcome::Failed(_) => "failed",
        }
    }
}

/// One row of the post-analysis summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSummary {
    pub slot: GarmentSlot,
    pub outcome: &'static str,
    pub model: Option<String>,
    pub detail: Option<String>,
    pub attempts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    pub baseline: Outfit,
    pub rows: Vec<SlotSummary>,
}

impl DetectionReport {
    pub fn found_count(&self) -> usize {
        self.rows.iter().filter(|row| row.outcome == "found").count()
    }
}

/// True when the model answered that the garment is absent.
pub fn is_negative_answer(text: &str) -> bool {
    let lowered = text.to_lowercase();
    let first_word = lowered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()));
    if first_word == Some("no") {
        return true;
    }
    NEGATIVE_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

pub fn detection_instruction(slot: &GarmentSlot) -> String {
    format!(
        "Check whether this garment is present in the photo.\n\
         \n\
         GARMENT: {description}\n\
         \n\
         Step 1: answer with exactly one word on the first line, YES or NO.\n\
         Step 2: only if you answered YES, extract that garment on a plain white background.\n\
         Return the extracted garment as inline base64 image data, not as an external URL.\n\
         \n\
         Rules:\n\
         - Do not invent garments that are not clearly visible.\n\
         - If the garment is not worn in the photo, answer NO and return no image.",
        description = slot.description
    )
}

struct DetectionInterpreter {
    fetcher: Arc<dyn ImageFetcher>,
}

#[async_trait]
impl ResponseInterpreter for DetectionInterpreter {
    type Output = DetectionOutcome;

    async fn interpret(&self, response: GenerationResponse) -> Verdict<DetectionOutcome> {
        if is_negative_answer(&response.text) {
            return Verdict::Accept(DetectionOutcome::NotPresent);
        }
        if let Some(image) = response.images.into_iter().find(InlineImage::is_image) {
            return Verdict::Accept(DetectionOutcome::Found(ImageRef::InlineData(image)));
        }
        if let Some(url) = first_usable_image_url(&response.text) {
            return match self.fetcher.fetch(&url).await {
                Ok(image) => Verdict::Accept(DetectionOutcome::Found(ImageRef::InlineData(image))),
                Err(err) => {
                    tracing::warn!(%url, error = %format!("{err:#}"), "garment url kept unconverted");
                    Verdict::Accept(DetectionOutcome::Found(ImageRef::RemoteUrl(url)))
                }
            };
        }
        Verdict::Advance("response carried neither an answer nor an image".to_string())
    }
}

pub struct Detector {
    providers: Arc<ProviderRegistry>,
    fetcher: Arc<dyn ImageFetcher>,
    candidates: Vec<ModelSpec>,
    timeout: Duration,
}

impl Detector {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        fetcher: Arc<dyn ImageFetcher>,
        candidates: Vec<ModelSpec>,
        timeout: Duration,
    ) -> Self {
        Self {
            providers,
            fetcher,
            candidates,
            timeout,
        }
    }

    pub async fn detect(&self, base: &InlineImage, slot: &GarmentSlot) -> DetectionOutcome {
        self.detect_slot(base, slot).await.0
    }

    async fn detect_slot(
        &self,
        base: &InlineImage,
        slot: &GarmentSlot,
    ) -> (DetectionOutcome, Option<String>, Vec<Attempt>) {
        let request = GenerationRequest {
            images: vec![ImagePart::from(base)],
            instruction: Some(detection_instruction(slot)),
            sampling: Sampling::detection(),
        };
        let interpreter = DetectionInterpreter {
            fetcher: self.fetcher.clone(),
        };
        match run_candidates(
            &self.providers,
            &self.candidates,
            &request,
            self.timeout,
            &interpreter,
        )
        .await
        {
            FallbackOutcome::Accepted {
                value,
                model,
                attempts,
            } => (value, Some(model), attempts),
            FallbackOutcome::Exhausted {
                last_reason,
                attempts,
            } => (DetectionOutcome::Failed(last_reason), None, attempts),
        }
    }

    /// Runs every slot in turn. A failed or absent slot stays empty and
    /// never stops the pass.
    pub async fn detect_all(&self, base: &InlineImage) -> DetectionReport {
        let mut report = DetectionReport::default();
        for slot in &GARMENT_SLOTS {
            let (outcome, model, attempts) = self.detect_slot(base, slot).await;
            let detail = match &outcome {
                DetectionOutcome::Found(image) => Some(image.kind().to_string()),
                DetectionOutcome::NotPresent => None,
                DetectionOutcome::Failed(reason) => Some(reason.clone()),
            };
            tracing::info!(slot = slot.key, outcome = outcome.label(), model = ?model, "slot analyzed");
            let label = outcome.label();
            if let DetectionOutcome::Found(image) = outcome {
                if let Err(err) = report.baseline.set(slot.position, Some(image)) {
                    tracing::warn!(slot = slot.key, error = %err, "detected garment not stored");
                }
            }
            report.rows.push(SlotSummary {
                slot: *slot,
                outcome: label,
                model,
                detail,
                attempts: attempts.len(),
            });
        }
        report
    }
}
