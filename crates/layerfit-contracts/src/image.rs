use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use uuid::Uuid;

pub const HANDLE_PREFIX: &str = "blob:layerfit/";

/// External hosts and patterns whose URLs are known to expire, refuse
/// cross-origin fetches, or point at placeholder art.
const INACCESSIBLE_URL_PATTERNS: &[&str] = &[
    "replicate.delivery",
    "file-cdn.flyai.com",
    "file-s3.omniwear.com",
    "placeholder",
    "imgur.com/result_",
];

const IMAGE_URL_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];

#[derive(Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl InlineImage {
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            data,
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, BASE64.encode(&self.data))
    }

    /// Parses `data:<media>;base64,<payload>`. Returns `None` for anything
    /// that is not a base64 data URL or fails to decode.
    pub fn from_data_url(raw: &str) -> Option<Self> {
        let (media_type, payload) = split_data_url(raw)?;
        let data = BASE64.decode(payload.as_bytes()).ok()?;
        Some(Self::new(media_type, data))
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

impl fmt::Debug for InlineImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineImage")
            .field("media_type", &self.media_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Splits a base64 data URL into its media type and encoded payload
/// without decoding the payload.
pub fn split_data_url(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    if media_type.is_empty() {
        return None;
    }
    Some((media_type, payload))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleId(String);

impl HandleId {
    fn fresh() -> Self {
        Self(format!("{HANDLE_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference to image content in one of three storage forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Process-local bytes held by a [`HandleStore`]. Dangles after restart.
    LocalHandle(HandleId),
    /// Self-contained bytes. The only form that is safe to persist.
    InlineData(InlineImage),
    /// Pointer to an external resource that may expire.
    RemoteUrl(String),
}

impl ImageRef {
    /// Classifies a raw string as stored by older sessions or typed by a
    /// user: data URLs become inline, `blob:` strings handles, everything
    /// else a remote URL.
    pub fn from_raw(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with("data:") {
            return InlineImage::from_data_url(trimmed).map(ImageRef::InlineData);
        }
        if trimmed.starts_with("blob:") {
            return Some(ImageRef::LocalHandle(HandleId(trimmed.to_string())));
        }
        Some(ImageRef::RemoteUrl(trimmed.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImageRef::LocalHandle(_) => "local_handle",
            ImageRef::InlineData(_) => "inline_data",
            ImageRef::RemoteUrl(_) => "remote_url",
        }
    }
}

/// Process-local registry standing behind `LocalHandle` references.
#[derive(Debug, Clone, Default)]
pub struct HandleStore {
    inner: Arc<Mutex<HashMap<HandleId, InlineImage>>>,
}

impl HandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image: InlineImage) -> ImageRef {
        let id = HandleId::fresh();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id.clone(), image);
        }
        ImageRef::LocalHandle(id)
    }

    pub fn get(&self, id: &HandleId) -> Option<InlineImage> {
        self.inner.lock().ok()?.get(id).cloned()
    }

    pub fn contains(&self, id: &HandleId) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(id))
            .unwrap_or(false)
    }

    pub fn release(&self, id: &HandleId) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn is_inaccessible_url(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    INACCESSIBLE_URL_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// Image URLs embedded in free text, in order of appearance. A URL
/// qualifies when its path ends in a known image extension.
pub fn extract_image_urls(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|token| {
            let start = token.find("http://").or_else(|| token.find("https://"))?;
            let candidate = token[start..].trim_end_matches(|c: char| {
                matches!(c, ')' | ']' | '>' | '"' | '\'' | ',' | ';' | '`' | '.')
            });
            let path = candidate
                .split(['?', '#'])
                .next()
                .unwrap_or(candidate)
                .to_ascii_lowercase();
            IMAGE_URL_EXTENSIONS
                .iter()
                .any(|ext| path.ends_with(ext))
                .then(|| candidate.to_string())
        })
        .collect()
}

/// First embedded image URL that is not on the inaccessible list.
pub fn first_usable_image_url(text: &str) -> Option<String> {
    extract_image_urls(text)
        .into_iter()
        .find(|url| !is_inaccessible_url(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_round_trips() {
        let image = InlineImage::new("image/png", vec![1, 2, 3, 4]);
        let url = image.to_data_url();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(InlineImage::from_data_url(&url), Some(image));
    }

    #[test]
    fn data_url_rejects_non_base64_forms() {
        assert!(InlineImage::from_data_url("data:image/svg+xml;charset=utf-8,%3Csvg").is_none());
        assert!(InlineImage::from_data_url("data:;base64,AAAA").is_none());
        assert!(InlineImage::from_data_url("https://example.com/a.png").is_none());
    }

    #[test]
    fn from_raw_classifies_each_form() {
        let inline = InlineImage::new("image/jpeg", vec![9; 8]).to_data_url();
        assert!(matches!(ImageRef::from_raw(&inline), Some(ImageRef::InlineData(_))));
        assert!(matches!(
            ImageRef::from_raw("blob:http://localhost/abc"),
            Some(ImageRef::LocalHandle(_))
        ));
        assert!(matches!(
            ImageRef::from_raw("https://cdn.example.com/shirt.png"),
            Some(ImageRef::RemoteUrl(_))
        ));
        assert_eq!(ImageRef::from_raw("   "), None);
    }

    #[test]
    fn handle_store_is_process_local() {
        let store = HandleStore::new();
        let ImageRef::LocalHandle(id) = store.insert(InlineImage::new("image/png", vec![7; 4]))
        else {
            panic!("insert must return a handle");
        };
        assert!(id.as_str().starts_with(HANDLE_PREFIX));
        assert_eq!(store.get(&id).map(|image| image.data), Some(vec![7; 4]));

        let other_process = HandleStore::new();
        assert!(!other_process.contains(&id));

        store.release(&id);
        assert!(store.is_empty());
    }

    #[test]
    fn denylist_matches_known_hosts_and_placeholders() {
        assert!(is_inaccessible_url("https://replicate.delivery/x/out.png"));
        assert!(is_inaccessible_url("https://via.PLACEHOLDER.com/300.png"));
        assert!(is_inaccessible_url("https://imgur.com/result_123.jpg"));
        assert!(!is_inaccessible_url("https://cdn.example.com/jacket.png"));
    }

    #[test]
    fn extracts_urls_with_image_extensions_only() {
        let text = "YES\nHere: https://cdn.example.com/a.png, also (https://x.io/b.JPG?sig=1) \
                    and https://x.io/page.html";
        assert_eq!(
            extract_image_urls(text),
            vec![
                "https://cdn.example.com/a.png".to_string(),
                "https://x.io/b.JPG?sig=1".to_string()
            ]
        );
    }

    #[test]
    fn first_usable_url_skips_denylisted_entries() {
        let text = "https://replicate.delivery/out.png https://cdn.example.com/ok.webp";
        assert_eq!(
            first_usable_image_url(text).as_deref(),
            Some("https://cdn.example.com/ok.webp")
        );
        assert_eq!(first_usable_image_url("https://placeholder.com/a.png"), None);
    }
}
