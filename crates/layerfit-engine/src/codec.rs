//! Moves image references across storage tiers.
//!
//! Only inline data survives a restart, so encoding turns handles and
//! remote URLs into data URLs and records which fields it converted.
//! Decoding validates converted fields and turns them back into fresh
//! process-local handles.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use layerfit_contracts::events::now_utc_iso;
use layerfit_contracts::image::{
    is_inaccessible_url, split_data_url, HandleStore, ImageRef, InlineImage,
};
use layerfit_contracts::layers::{capacity_of, Category, SlotPosition};
use layerfit_contracts::session::{Outfit, SessionState, Status};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STORED_SESSION_VERSION: u32 = 1;
pub const JPEG_QUALITY: u8 = 70;
pub const MIN_PAYLOAD_CHARS: usize = 100;
pub const MIN_DECODED_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid image payload: {0}")]
    InvalidPayload(String),

    #[error("handle {0} is not registered in this process")]
    DanglingHandle(String),

    #[error("url is on the inaccessible list: {0}")]
    InaccessibleUrl(String),

    #[error("image fetch failed: {0}")]
    Fetch(String),

    #[error("stored session is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Retrieves remote image content.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<InlineImage>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build image fetch client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<InlineImage> {
        if is_inaccessible_url(url) {
            bail!("refusing to fetch inaccessible url {url}");
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("image request failed ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("image request failed ({}): {url}", status.as_u16());
        }
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if !media_type.starts_with("image/") {
            bail!("unexpected content type '{media_type}' for {url}");
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("image body read failed ({url})"))?;
        Ok(InlineImage::new(media_type, bytes.to_vec()))
    }
}

/// Resolves any reference to bytes: handles through the store, remote
/// URLs through the fetcher.
pub async fn resolve_image(
    image: &ImageRef,
    handles: &HandleStore,
    fetcher: &dyn ImageFetcher,
) -> Result<InlineImage, CodecError> {
    match image {
        ImageRef::InlineData(inline) => Ok(inline.clone()),
        ImageRef::LocalHandle(id) => handles
            .get(id)
            .ok_or_else(|| CodecError::DanglingHandle(id.to_string())),
        ImageRef::RemoteUrl(url) => {
            if is_inaccessible_url(url) {
                return Err(CodecError::InaccessibleUrl(url.clone()));
            }
            fetcher
                .fetch(url)
                .await
                .map_err(|err| CodecError::Fetch(format!("{err:#}")))
        }
    }
}

/// Longest-side bounds for recompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionBounds {
    pub thumbnail: u32,
    pub primary: u32,
}

impl Default for CompressionBounds {
    fn default() -> Self {
        Self {
            thumbnail: 512,
            primary: 800,
        }
    }
}

/// Downscales to `max_side` and re-encodes as JPEG. Images already inside
/// the bound, and bytes that do not decode, are returned unchanged.
pub fn recompress(image: &InlineImage, max_side: u32) -> InlineImage {
    let decoded = match image::load_from_memory(&image.data) {
        Ok(decoded) => decoded,
        Err(err) => {
            tracing::warn!(error = %err, media_type = %image.media_type, "recompression skipped; image does not decode");
            return image.clone();
        }
    };
    if decoded.width() <= max_side && decoded.height() <= max_side {
        return image.clone();
    }

    let resized = decoded
        .resize(max_side, max_side, FilterType::Triangle)
        .to_rgb8();
    let mut bytes = Vec::new();
    let encoded = {
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
        encoder.encode_image(&resized)
    };
    if let Err(err) = encoded {
        tracing::warn!(error = %err, "recompression failed; keeping original bytes");
        return image.clone();
    }
    InlineImage::new("image/jpeg", bytes)
}

/// Validates a data URL written by [`SessionCodec::encode`]: a payload of
/// at least [`MIN_PAYLOAD_CHARS`] characters in the standard base64
/// alphabet that decodes to at least [`MIN_DECODED_BYTES`] bytes.
pub fn validate_data_url(raw: &str) -> Result<InlineImage, CodecError> {
    let (media_type, payload) = split_data_url(raw)
        .ok_or_else(|| CodecError::InvalidPayload("not a base64 data url".to_string()))?;
    if payload.len() < MIN_PAYLOAD_CHARS {
        return Err(CodecError::InvalidPayload(format!(
            "payload too short ({} chars)",
            payload.len()
        )));
    }
    let body = payload.trim_end_matches('=');
    let padding = payload.len() - body.len();
    if padding > 2
        || !body
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'/')
    {
        return Err(CodecError::InvalidPayload(
            "payload is not standard base64".to_string(),
        ));
    }
    let data = BASE64
        .decode(payload.as_bytes())
        .map_err(|err| CodecError::InvalidPayload(format!("payload does not decode: {err}")))?;
    if data.len() < MIN_DECODED_BYTES {
        return Err(CodecError::InvalidPayload(format!(
            "decoded image too small ({} bytes)",
            data.len()
        )));
    }
    Ok(InlineImage::new(media_type, data))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredOutfit {
    pub outer: Vec<Option<String>>,
    pub inner: Vec<Option<String>>,
    pub bottoms: Vec<Option<String>>,
}

impl StoredOutfit {
    fn slots(&self, category: Category) -> &[Option<String>] {
        match category {
            Category::Outer => &self.outer,
            Category::Inner => &self.inner,
            Category::Bottoms => &self.bottoms,
        }
    }

    fn slots_mut(&mut self, category: Category) -> &mut Vec<Option<String>> {
        match category {
            Category::Outer => &mut self.outer,
            Category::Inner => &mut self.inner,
            Category::Bottoms => &mut self.bottoms,
        }
    }
}

/// Slot indices, per category, whose stored value was converted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotFlags {
    pub outer: BTreeSet<usize>,
    pub inner: BTreeSet<usize>,
    pub bottoms: BTreeSet<usize>,
}

impl SlotFlags {
    pub fn contains(&self, position: SlotPosition) -> bool {
        self.set(position.category).contains(&position.index)
    }

    fn set(&self, category: Category) -> &BTreeSet<usize> {
        match category {
            Category::Outer => &self.outer,
            Category::Inner => &self.inner,
            Category::Bottoms => &self.bottoms,
        }
    }

    fn insert(&mut self, position: SlotPosition) {
        let set = match position.category {
            Category::Outer => &mut self.outer,
            Category::Inner => &mut self.inner,
            Category::Bottoms => &mut self.bottoms,
        };
        set.insert(position.index);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertedFlags {
    pub base_image: bool,
    pub composed_image: bool,
    pub baseline_outfit: SlotFlags,
    pub user_slots: SlotFlags,
}

/// Serialized form of a session as written to both storage tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredSession {
    pub version: u32,
    pub status: Status,
    pub base_image: Option<String>,
    pub baseline_outfit: StoredOutfit,
    pub user_slots: StoredOutfit,
    pub composed_image: Option<String>,
    pub prompt: String,
    pub error_message: Option<String>,
    pub converted: ConvertedFlags,
    pub saved_at: String,
}

impl StoredSession {
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Thumbnail,
    Primary,
}

/// Encoder and decoder bound to one process's handle store.
#[derive(Clone)]
pub struct SessionCodec {
    handles: HandleStore,
    fetcher: Arc<dyn ImageFetcher>,
    bounds: CompressionBounds,
}

impl SessionCodec {
    pub fn new(
        handles: HandleStore,
        fetcher: Arc<dyn ImageFetcher>,
        bounds: CompressionBounds,
    ) -> Self {
        Self {
            handles,
            fetcher,
            bounds,
        }
    }

    pub fn handles(&self) -> &HandleStore {
        &self.handles
    }

    pub async fn encode(&self, state: &SessionState) -> StoredSession {
        let mut converted = ConvertedFlags::default();

        let (base_image, flag) = self.encode_field(state.base_image.as_ref(), Role::Primary).await;
        converted.base_image = flag;
        let (composed_image, flag) = self
            .encode_field(state.composed_image.as_ref(), Role::Primary)
            .await;
        converted.composed_image = flag;
        let baseline_outfit = self
            .encode_outfit(&state.baseline_outfit, &mut converted.baseline_outfit)
            .await;
        let user_slots = self
            .encode_outfit(&state.user_slots, &mut converted.user_slots)
            .await;

        StoredSession {
            version: STORED_SESSION_VERSION,
            status: state.status,
            base_image,
            baseline_outfit,
            user_slots,
            composed_image,
            prompt: state.prompt.clone(),
            error_message: state.error_message.clone(),
            converted,
            saved_at: String::new(),
        }
    }

    async fn encode_outfit(&self, outfit: &Outfit, flags: &mut SlotFlags) -> StoredOutfit {
        let mut stored = StoredOutfit::default();
        for category in Category::ALL {
            stored.slots_mut(category).resize(capacity_of(category), None);
        }
        for (position, image) in outfit.positions() {
            let (value, flag) = self.encode_field(image, Role::Thumbnail).await;
            if flag {
                flags.insert(position);
            }
            if let Some(slot) = stored.slots_mut(position.category).get_mut(position.index) {
                *slot = value;
            }
        }
        stored
    }

    async fn encode_field(&self, image: Option<&ImageRef>, role: Role) -> (Option<String>, bool) {
        let Some(image) = image else {
            return (None, false);
        };
        let max_side = match role {
            Role::Thumbnail => self.bounds.thumbnail,
            Role::Primary => self.bounds.primary,
        };
        match image {
            ImageRef::InlineData(inline) => (Some(inline.to_data_url()), false),
            ImageRef::LocalHandle(_) | ImageRef::RemoteUrl(_) => {
                match resolve_image(image, &self.handles, self.fetcher.as_ref()).await {
                    Ok(inline) => (Some(recompress(&inline, max_side).to_data_url()), true),
                    Err(err) => {
                        tracing::warn!(error = %err, kind = image.kind(), "image dropped from saved state");
                        (None, false)
                    }
                }
            }
        }
    }

    /// Rebuilds a session. Fields that fail validation are dropped rather
    /// than failing the whole restore. The status is derived from which
    /// images survived.
    pub fn decode(&self, stored: &StoredSession) -> SessionState {
        let base_image = self.decode_field(
            stored.base_image.as_deref(),
            stored.converted.base_image,
            "base_image",
        );
        let composed_image = self.decode_field(
            stored.composed_image.as_deref(),
            stored.converted.composed_image,
            "composed_image",
        );
        let baseline_outfit =
            self.decode_outfit(&stored.baseline_outfit, &stored.converted.baseline_outfit);
        let user_slots = self.decode_outfit(&stored.user_slots, &stored.converted.user_slots);

        let status = if composed_image.is_some() {
            Status::Done
        } else if base_image.is_some() {
            Status::Ready
        } else {
            Status::Empty
        };

        SessionState {
            status,
            base_image,
            baseline_outfit,
            user_slots,
            composed_image,
            prompt: stored.prompt.clone(),
            error_message: None,
        }
    }

    fn decode_outfit(&self, stored: &StoredOutfit, flags: &SlotFlags) -> Outfit {
        let mut outfit = Outfit::default();
        for category in Category::ALL {
            for (index, raw) in stored
                .slots(category)
                .iter()
                .take(capacity_of(category))
                .enumerate()
            {
                let position = SlotPosition::new(category, index);
                let field = position.to_string();
                let value = self.decode_field(raw.as_deref(), flags.contains(position), &field);
                if let Some(slot) = outfit.slots_mut(category).get_mut(index) {
                    *slot = value;
                }
            }
        }
        outfit
    }

    fn decode_field(&self, raw: Option<&str>, converted: bool, field: &str) -> Option<ImageRef> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        if converted {
            return match validate_data_url(raw) {
                Ok(inline) => Some(self.handles.insert(inline)),
                Err(err) => {
                    tracing::warn!(field, error = %err, "saved image failed validation; dropped");
                    None
                }
            };
        }
        if raw.starts_with("data:") {
            return InlineImage::from_data_url(raw).map(ImageRef::InlineData);
        }
        if raw.starts_with("blob:") {
            tracing::debug!(field, "dangling handle from an earlier process; dropped");
            return None;
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Some(ImageRef::RemoteUrl(raw.to_string()));
        }
        None
    }
}

/// Stamps and serializes a stored session.
pub fn to_blob(mut stored: StoredSession) -> Result<String, CodecError> {
    stored.saved_at = now_utc_iso();
    stored.to_json()
}
