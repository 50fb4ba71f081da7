use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use layerfit_contracts::image::InlineImage;
use sha2::{Digest, Sha256};

use super::{GenerationRequest, GenerationResponse, GenerationService, ProviderError};

const DRYRUN_WIDTH: u32 = 384;
const DRYRUN_HEIGHT: u32 = 512;

/// Offline provider. Answers every request with "YES" and a solid-color
/// PNG whose color is derived from the request contents, so identical
/// requests produce identical images.
pub struct DryrunProvider;

#[async_trait]
impl GenerationService for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let (r, g, b) = color_from_request(model, request);
        let mut image = RgbImage::new(DRYRUN_WIDTH, DRYRUN_HEIGHT);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| ProviderError::Server {
                status: 500,
                message: format!("dryrun image encode failed: {err}"),
            })?;

        Ok(GenerationResponse {
            images: vec![InlineImage::new("image/png", bytes)],
            text: "YES".to_string(),
        })
    }
}

fn color_from_request(model: &str, request: &GenerationRequest) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    for image in &request.images {
        hasher.update(&image.bytes);
    }
    if let Some(instruction) = request.instruction.as_deref() {
        hasher.update(instruction.as_bytes());
    }
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
