//! Test doubles shared by the engine's unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use layerfit_contracts::image::InlineImage;

use crate::codec::ImageFetcher;
use crate::provider::{GenerationRequest, GenerationResponse, GenerationService, ProviderError};

/// Small valid PNG with a distinct shade. The gradient keeps the encoded
/// size well above the restore validation minimum.
pub(crate) fn sample_png(shade: u8) -> InlineImage {
    let mut image = RgbImage::new(24, 32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        *pixel = Rgb([shade, (x * 7) as u8 ^ shade, (y * 5) as u8]);
    }
    let mut bytes = Vec::new();
    if image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .is_err()
    {
        bytes.clear();
    }
    InlineImage::new("image/png", bytes)
}

#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Reply(GenerationResponse),
    Fail(ProviderError),
    /// Never answers; only a timeout ends the call.
    Hang,
}

impl Scripted {
    pub(crate) fn text(text: &str) -> Self {
        Scripted::Reply(GenerationResponse {
            images: Vec::new(),
            text: text.to_string(),
        })
    }

    pub(crate) fn image(image: InlineImage) -> Self {
        Scripted::Reply(GenerationResponse {
            images: vec![image],
            text: String::new(),
        })
    }

    pub(crate) fn rate_limited() -> Self {
        Scripted::Fail(ProviderError::RateLimited("quota".to_string()))
    }
}

/// Replays a per-model queue of outcomes and records who was contacted.
/// Models with an exhausted queue answer with their fallback outcome, or
/// `ModelNotFound` when none is set.
#[derive(Clone, Default)]
pub(crate) struct ScriptedService {
    inner: Arc<Mutex<ScriptedInner>>,
}

#[derive(Default)]
struct ScriptedInner {
    queues: HashMap<String, VecDeque<Scripted>>,
    fallback: HashMap<String, Scripted>,
    contacts: Vec<String>,
    requests: Vec<GenerationRequest>,
}

impl ScriptedService {
    pub(crate) fn push(&self, model: &str, outcome: Scripted) -> &Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .queues
                .entry(model.to_string())
                .or_default()
                .push_back(outcome);
        }
        self
    }

    pub(crate) fn always(&self, model: &str, outcome: Scripted) -> &Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fallback.insert(model.to_string(), outcome);
        }
        self
    }

    pub(crate) fn contacts(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.contacts.clone())
            .unwrap_or_default()
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.inner
            .lock()
            .map(|inner| inner.requests.clone())
            .unwrap_or_default()
    }

    fn next(&self, model: &str, request: &GenerationRequest) -> Scripted {
        let Ok(mut inner) = self.inner.lock() else {
            return Scripted::Fail(ProviderError::Transport("poisoned".to_string()));
        };
        inner.contacts.push(model.to_string());
        inner.requests.push(request.clone());
        if let Some(outcome) = inner.queues.get_mut(model).and_then(VecDeque::pop_front) {
            return outcome;
        }
        inner
            .fallback
            .get(model)
            .cloned()
            .unwrap_or_else(|| Scripted::Fail(ProviderError::ModelNotFound(model.to_string())))
    }
}

#[async_trait]
impl GenerationService for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        match self.next(model, request) {
            Scripted::Reply(response) => Ok(response),
            Scripted::Fail(err) => Err(err),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::Timeout)
            }
        }
    }
}

/// Serves fixed images by URL; everything else fails like a 404.
#[derive(Clone, Default)]
pub(crate) struct MapFetcher {
    images: Arc<HashMap<String, InlineImage>>,
}

impl MapFetcher {
    pub(crate) fn with(mut self, url: &str, image: InlineImage) -> Self {
        Arc::make_mut(&mut self.images).insert(url.to_string(), image);
        self
    }
}

#[async_trait]
impl ImageFetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<InlineImage> {
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("image request failed (404): {url}"))
    }
}
