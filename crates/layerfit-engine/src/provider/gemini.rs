use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use layerfit_contracts::image::InlineImage;
use reqwest::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{
    non_empty_env, truncate_text, GenerationRequest, GenerationResponse, GenerationService,
    ProviderError,
};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// `generateContent` adapter. Reads `GEMINI_API_KEY` (or `GOOGLE_API_KEY`)
/// per call so a key exported mid-session is picked up.
pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self::with_api_base(
            non_empty_env("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        )
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerationRequest) -> Value {
        let mut parts: Vec<Value> = request
            .images
            .iter()
            .map(|image| {
                json!({
                    "inlineData": {
                        "mimeType": image.media_type,
                        "data": BASE64.encode(&image.bytes),
                    }
                })
            })
            .collect();
        if let Some(instruction) = request
            .instruction
            .as_deref()
            .filter(|text| !text.trim().is_empty())
        {
            parts.push(json!({ "text": instruction }));
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{ "role": "user", "parts": parts }]),
        );
        payload.insert(
            "generationConfig".to_string(),
            json!({
                "temperature": request.sampling.temperature,
                "topK": request.sampling.top_k,
                "topP": request.sampling.top_p,
                "responseModalities": ["TEXT", "IMAGE"],
            }),
        );
        payload.insert(
            "safetySettings".to_string(),
            Value::Array(Self::default_safety_settings()),
        );
        Value::Object(payload)
    }

    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "OFF",
            })
        })
        .collect()
    }

    fn candidate_parts(response_payload: &Value) -> Vec<Value> {
        response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|candidate| {
                candidate
                    .get("content")
                    .and_then(|content| content.get("parts"))
                    .and_then(Value::as_array)
            })
            .flatten()
            .cloned()
            .collect()
    }

    fn parse_response(response_payload: &Value) -> Result<GenerationResponse, ProviderError> {
        let mut images = Vec::new();
        let mut text = Vec::new();

        for part in Self::candidate_parts(response_payload) {
            if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                text.push(chunk.to_string());
            }
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                ProviderError::Transport(format!("Gemini image base64 decode failed: {err}"))
            })?;
            let media_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            images.push(InlineImage::new(media_type, bytes));
        }

        Ok(GenerationResponse {
            images,
            text: text.join("\n"),
        })
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        return ProviderError::Timeout;
    }
    ProviderError::Transport(truncate_text(&err.to_string(), 512))
}

#[async_trait]
impl GenerationService for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let Some(api_key) = Self::api_key() else {
            return Err(ProviderError::MissingCredentials(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            ));
        };
        let endpoint = self.endpoint_for_model(model);
        tracing::debug!(%endpoint, images = request.images.len(), "gemini request");

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .json(&Self::build_payload(request))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            ProviderError::Transport(format!("Gemini returned invalid JSON payload: {err}"))
        })?;
        Self::parse_response(&parsed)
    }
}
